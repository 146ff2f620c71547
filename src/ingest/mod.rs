//! Frame capture.
//!
//! Sources produce `RawFrame`s with strictly increasing ids. A
//! `CaptureDriver` owns one source on its own thread and feeds the pipeline
//! at a target rate. The driver never blocks on the pipeline: a full queue
//! evicts inside `submit_frame`.

mod synthetic;

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::RawFrame;
use crate::pipeline::Pipeline;

pub use synthetic::SyntheticSource;

/// Capture source statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub name: String,
}

pub trait FrameSource: Send {
    /// Acquire the capture resource. Failure aborts `CaptureDriver::spawn`.
    fn connect(&mut self) -> Result<()>;

    fn next_frame(&mut self) -> Result<RawFrame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Producer thread that pulls from a source and submits to a pipeline.
pub struct CaptureDriver {
    active: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    submitted: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl CaptureDriver {
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        pipeline: Arc<Pipeline>,
        target_fps: u32,
    ) -> Result<Self> {
        if target_fps == 0 {
            return Err(anyhow!("capture target fps must be positive"));
        }
        source.connect().context("connect capture source")?;

        let active = Arc::new(AtomicBool::new(true));
        let captured = Arc::new(AtomicU64::new(0));
        let submitted = Arc::new(AtomicU64::new(0));
        let interval = Duration::from_secs_f64(1.0 / target_fps as f64);

        let thread_active = active.clone();
        let thread_captured = captured.clone();
        let thread_submitted = submitted.clone();
        let join = std::thread::Builder::new()
            .name("relay-capture".into())
            .spawn(move || {
                log::info!(
                    "capture started: {} at {} fps",
                    source.stats().name,
                    target_fps
                );
                while thread_active.load(Ordering::Acquire) {
                    let tick = Instant::now();
                    match source.next_frame() {
                        Ok(frame) => {
                            thread_captured.fetch_add(1, Ordering::Relaxed);
                            if pipeline.submit_frame(frame) {
                                thread_submitted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(err) => {
                            log::warn!("capture failed: {:#}", err);
                            if !source.is_healthy() {
                                log::error!("capture source unhealthy; stopping capture");
                                break;
                            }
                        }
                    }
                    let spent = tick.elapsed();
                    if spent < interval {
                        std::thread::sleep(interval - spent);
                    }
                }
                thread_active.store(false, Ordering::Release);
                log::info!(
                    "capture stopped after {} frame(s)",
                    thread_captured.load(Ordering::Relaxed)
                );
            })
            .context("failed to spawn capture thread")?;

        Ok(Self {
            active,
            captured,
            submitted,
            join: Some(join),
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Frames the pipeline accepted; lower than `frames_captured` while it is stopped.
    pub fn frames_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// False once the capture thread has exited, e.g. after its source went unhealthy.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Signal the thread and wait for it. At most one frame interval.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
