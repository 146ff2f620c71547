//! Frame types and the bounded capture queue.
//!
//! - `RawFrame`: one captured image, owned by the capture source until admitted.
//! - `ProcessedFrame`: filtered + encoded output, immutable once built.
//! - `FilterKind`: the selectable transform applied per frame.
//! - `FrameQueue`: fixed-capacity FIFO with drop-oldest admission.
//!
//! The queue never blocks a producer. When it is full the oldest buffered
//! frame is evicted to make room, so the net depth stays at capacity.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Queue depth used when nothing else is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// Layout of the bytes carried by a `RawFrame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    Gray8,
    Nv12,
}

impl PixelFormat {
    /// Expected buffer length for a frame of this format, if it does not overflow.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Rgb24 => pixels.checked_mul(3),
            PixelFormat::Rgba32 => pixels.checked_mul(4),
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Nv12 => pixels.checked_add(pixels / 2),
        }
    }
}

/// Unprocessed captured image.
///
/// Ids are assigned by the capture source and must increase strictly per source.
pub struct RawFrame {
    pub id: u64,
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub captured_at: SystemTime,
    capture_instant: Instant,
}

impl RawFrame {
    pub fn new(id: u64, data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id,
            data,
            width,
            height,
            format,
            captured_at: SystemTime::now(),
            capture_instant: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Time since capture; logged by the worker as queue latency.
    pub fn age(&self) -> Duration {
        self.capture_instant.elapsed()
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FilterKind
// ----------------------------------------------------------------------------

/// Transform applied by the processing worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FilterKind {
    Grayscale = 0,
    #[default]
    EdgeDetect = 1,
    Passthrough = 2,
}

impl FilterKind {
    pub const ALL: [FilterKind; 3] = [
        FilterKind::Grayscale,
        FilterKind::EdgeDetect,
        FilterKind::Passthrough,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterKind::Grayscale => "grayscale",
            FilterKind::EdgeDetect => "edge_detect",
            FilterKind::Passthrough => "passthrough",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FilterKind::Grayscale),
            1 => Some(FilterKind::EdgeDetect),
            2 => Some(FilterKind::Passthrough),
            _ => None,
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "grayscale" | "gray" | "greyscale" => Ok(FilterKind::Grayscale),
            "edge_detect" | "edge" | "edges" | "canny" => Ok(FilterKind::EdgeDetect),
            "passthrough" | "original" | "none" => Ok(FilterKind::Passthrough),
            other => Err(anyhow!(
                "unknown filter '{}'; expected grayscale, edge_detect or passthrough",
                other
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// ProcessedFrame
// ----------------------------------------------------------------------------

/// Encoded output of one processed `RawFrame`.
///
/// Fields are private; a built frame is never mutated, so readers holding an
/// older `Arc<ProcessedFrame>` keep a consistent view after a new publish.
#[derive(Debug)]
pub struct ProcessedFrame {
    source_frame_id: u64,
    encoded: Vec<u8>,
    content_type: &'static str,
    filter: FilterKind,
    processing: Duration,
}

impl ProcessedFrame {
    pub fn new(
        source_frame_id: u64,
        encoded: Vec<u8>,
        content_type: &'static str,
        filter: FilterKind,
        processing: Duration,
    ) -> Self {
        Self {
            source_frame_id,
            encoded,
            content_type,
            filter,
            processing,
        }
    }

    pub fn source_frame_id(&self) -> u64 {
        self.source_frame_id
    }

    pub fn encoded_bytes(&self) -> &[u8] {
        &self.encoded
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn filter(&self) -> FilterKind {
        self.filter
    }

    pub fn processing_duration(&self) -> Duration {
        self.processing
    }

    pub fn processing_duration_ms(&self) -> f64 {
        self.processing.as_secs_f64() * 1000.0
    }
}

// ----------------------------------------------------------------------------
// FrameQueue: bounded, drop-oldest
// ----------------------------------------------------------------------------

/// Result of offering a frame to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// There was room; nothing was evicted.
    Queued,
    /// The queue was full; the oldest frame was evicted first.
    ReplacedOldest { evicted_id: u64 },
}

struct QueueState {
    frames: VecDeque<RawFrame>,
    admitted: u64,
    dropped: u64,
}

/// Fixed-capacity FIFO between capture and processing.
///
/// Eviction and insertion happen under one lock, so concurrent producers can
/// never push the depth past `capacity`, not even transiently.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl FrameQueue {
    /// Capacities below 1 are raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                admitted: 0,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a frame without blocking, evicting the oldest entry when full.
    pub fn try_enqueue(&self, frame: RawFrame) -> Admission {
        let admission = {
            let mut state = self.lock();
            let admission = if state.frames.len() >= self.capacity {
                // Drop releases the evicted pixel buffer.
                let evicted = state.frames.pop_front();
                state.dropped += 1;
                Admission::ReplacedOldest {
                    evicted_id: evicted.map(|f| f.id).unwrap_or_default(),
                }
            } else {
                Admission::Queued
            };
            state.frames.push_back(frame);
            state.admitted += 1;
            admission
        };
        self.ready.notify_one();
        admission
    }

    /// Pop the oldest frame, waiting at most `timeout` for one to arrive.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<RawFrame> {
        let guard = self.lock();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |state| state.frames.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        guard.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames accepted since the last reset.
    pub fn admitted(&self) -> u64 {
        self.lock().admitted
    }

    /// Frames evicted by drop-oldest since the last reset.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Consistent (admitted, dropped, depth) triple taken under one lock.
    pub fn counts(&self) -> (u64, u64, usize) {
        let state = self.lock();
        (state.admitted, state.dropped, state.frames.len())
    }

    /// Ids currently buffered, oldest first.
    pub fn queued_ids(&self) -> Vec<u64> {
        self.lock().frames.iter().map(|f| f.id).collect()
    }

    /// Discard buffered frames and zero the counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.admitted = 0;
        state.dropped = 0;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
