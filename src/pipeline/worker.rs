//! Processing worker loop.
//!
//! One worker per pipeline run. Each iteration waits (bounded) for a frame,
//! applies the active filter, encodes, and publishes to the latest-frame
//! cell. Failures are contained per frame. A frame that finishes after its
//! run was stopped is discarded instead of published.

use anyhow::{anyhow, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::encode::FrameEncoder;
use crate::filter::FrameTransform;
use crate::frame::{ProcessedFrame, RawFrame};

use super::metrics::FpsWindow;
use super::{RunState, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Alive,
    Exited,
}

/// Sends `Exited` however the worker leaves its loop, panics included.
struct ExitNotice(Sender<WorkerEvent>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(WorkerEvent::Exited);
    }
}

pub(crate) struct ProcessingWorker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) run: Arc<RunState>,
    pub(crate) transform: Arc<Mutex<dyn FrameTransform>>,
    pub(crate) encoder: Arc<dyn FrameEncoder>,
    pub(crate) dequeue_wait: Duration,
    pub(crate) events: Sender<WorkerEvent>,
}

impl ProcessingWorker {
    pub(crate) fn run(self) {
        let _exit = ExitNotice(self.events.clone());
        // Alive is only reported once the transform can be locked.
        let transform_name = self.lock_transform().name();
        if self.events.send(WorkerEvent::Alive).is_err() {
            return;
        }
        log::info!("processing worker started (transform {})", transform_name);

        let queue = &self.run.queue;
        let mut window = FpsWindow::new();
        let mut dropped_at_window_start = queue.dropped();

        while self.run.active.load(Ordering::Acquire) {
            if let Some(frame) = queue.dequeue_timeout(self.dequeue_wait) {
                log::trace!("frame {} waited {:?} in queue", frame.id, frame.age());
                if self.handle_frame(frame) {
                    window.record();
                }
            }

            if let Some(fps) = window.roll() {
                self.run.counters.set_fps(fps);
                let dropped = queue.dropped();
                if dropped > dropped_at_window_start {
                    log::warn!(
                        "frame queue overflow: dropped {} frame(s) in the last window",
                        dropped - dropped_at_window_start
                    );
                }
                dropped_at_window_start = dropped;
                log::debug!(
                    "pipeline fps={:.1} queue={} processed={}",
                    fps,
                    queue.len(),
                    self.run.counters.processed()
                );
            }
        }
        log::info!("processing worker stopped");
    }

    /// Returns true when the frame was published.
    fn handle_frame(&self, frame: RawFrame) -> bool {
        let frame_id = frame.id;
        self.run.processing.store(true, Ordering::Release);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(frame)))
            .unwrap_or_else(|_| Err(anyhow!("transform panicked")));
        self.run.processing.store(false, Ordering::Release);

        match outcome {
            Ok(_) if !self.run.active.load(Ordering::Acquire) => {
                self.run.counters.record_failed();
                log::debug!("frame {} finished after stop; discarded", frame_id);
                false
            }
            Ok(processed) => {
                let took = processed.processing_duration();
                self.shared.latest.publish(processed);
                self.run.counters.record_processed(took);
                true
            }
            Err(err) => {
                self.run.counters.record_failed();
                log::warn!("frame {} discarded: {:#}", frame_id, err);
                false
            }
        }
    }

    fn lock_transform(&self) -> MutexGuard<'_, dyn FrameTransform + 'static> {
        self.transform.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, frame: RawFrame) -> Result<ProcessedFrame> {
        let started = Instant::now();
        let kind = self.shared.active_filter();
        let image = self.lock_transform().apply(kind, &frame)?;
        let encoded = self.encoder.encode(&image)?;
        Ok(ProcessedFrame::new(
            frame.id,
            encoded,
            self.encoder.content_type(),
            kind,
            started.elapsed(),
        ))
    }
}
