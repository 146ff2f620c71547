//! Latest-value cell holding the most recently processed frame.
//!
//! One writer (the processing worker) overwrites the slot; any number of
//! HTTP handlers read it. The lock only guards an `Arc` swap or clone, so a
//! reader never waits on encoding work and never observes a half-built frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::frame::ProcessedFrame;

pub struct LatestFrame {
    slot: Mutex<Option<Arc<ProcessedFrame>>>,
    publishes: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            publishes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ProcessedFrame>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the held frame. Readers that already hold the previous frame keep it.
    pub fn publish(&self, frame: ProcessedFrame) {
        let frame = Arc::new(frame);
        let previous = {
            let mut slot = self.lock();
            slot.replace(frame)
        };
        self.publishes.fetch_add(1, Ordering::Release);
        // The old frame is released outside the critical section.
        drop(previous);
    }

    /// Current frame, or `None` before the first publish.
    pub fn read_latest(&self) -> Option<Arc<ProcessedFrame>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        let previous = self.lock().take();
        drop(previous);
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Acquire)
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}
