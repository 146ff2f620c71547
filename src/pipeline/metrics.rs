use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// FPS is recomputed once per window of this length.
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Read-only snapshot of pipeline throughput.
///
/// Fields are sampled independently; they are eventually consistent with
/// each other. At a quiescent point
/// `frames_admitted == frames_processed + frames_dropped + queue_depth`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub frames_admitted: u64,
    pub frames_processed: u64,
    /// Evicted by drop-oldest plus `frames_failed`.
    pub frames_dropped: u64,
    /// Discarded after a transform or encode failure, or finished after stop.
    pub frames_failed: u64,
    pub current_fps: f64,
    pub queue_depth: usize,
    pub is_running: bool,
    pub last_processing_ms: f64,
}

/// Counters written only by the processing worker.
#[derive(Default)]
pub(crate) struct WorkerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    fps_bits: AtomicU64,
    last_processing_us: AtomicU64,
}

impl WorkerCounters {
    pub(crate) fn record_processed(&self, took: Duration) {
        self.last_processing_us
            .store(took.as_micros() as u64, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Release);
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Acquire))
    }

    pub(crate) fn last_processing_ms(&self) -> f64 {
        self.last_processing_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub(crate) fn reset(&self) {
        self.processed.store(0, Ordering::Release);
        self.failed.store(0, Ordering::Release);
        self.fps_bits.store(0f64.to_bits(), Ordering::Release);
        self.last_processing_us.store(0, Ordering::Relaxed);
    }
}

/// Rolling frames-per-second window.
pub(crate) struct FpsWindow {
    started: Instant,
    frames: u64,
}

impl FpsWindow {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
        }
    }

    pub(crate) fn record(&mut self) {
        self.frames += 1;
    }

    /// Returns the FPS of the finished window once `FPS_WINDOW` has elapsed.
    pub(crate) fn roll(&mut self) -> Option<f64> {
        let elapsed = self.started.elapsed();
        if elapsed < FPS_WINDOW {
            return None;
        }
        let fps = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.started = Instant::now();
        Some(fps)
    }
}
