//! Frame pipeline: capture queue, processing worker, latest-frame publication.
//!
//! Capture sources call `Pipeline::submit_frame`; the worker drains the
//! queue and publishes into the shared `LatestFrame` that the streaming
//! server reads. Start and stop are cooperative:
//! - `start` returns only after the worker has reported it is alive.
//! - `stop` waits up to a grace period for the worker to exit, then proceeds.

mod metrics;
mod worker;

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::api::ControlHandler;
use crate::encode::FrameEncoder;
use crate::filter::FrameTransform;
use crate::frame::{Admission, FilterKind, FrameQueue, RawFrame, DEFAULT_QUEUE_CAPACITY};
use crate::publish::LatestFrame;

pub use metrics::{PipelineMetrics, FPS_WINDOW};

pub(crate) use metrics::FpsWindow;

use metrics::WorkerCounters;
use worker::{ProcessingWorker, WorkerEvent};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    /// Longest the worker blocks on an empty queue before re-checking its stop flag.
    pub dequeue_wait: Duration,
    /// How long `stop` waits for the worker before detaching it.
    pub stop_grace: Duration,
    /// How long `start` waits for the worker to report it is alive.
    pub startup_timeout: Duration,
    pub initial_filter: FilterKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dequeue_wait: Duration::from_millis(10),
            stop_grace: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(1),
            initial_filter: FilterKind::default(),
        }
    }
}

/// State that outlives individual runs.
pub(crate) struct Shared {
    pub(crate) latest: Arc<LatestFrame>,
    filter: AtomicU8,
}

impl Shared {
    pub(crate) fn active_filter(&self) -> FilterKind {
        FilterKind::from_u8(self.filter.load(Ordering::Acquire)).unwrap_or_default()
    }
}

/// Queue and counters of one `start`..`stop` run.
///
/// Every `start` builds a fresh one, so a worker detached by `stop` can only
/// write into the run it was spawned for.
pub(crate) struct RunState {
    pub(crate) queue: FrameQueue,
    pub(crate) counters: WorkerCounters,
    pub(crate) processing: AtomicBool,
    pub(crate) active: AtomicBool,
}

impl RunState {
    fn new(capacity: usize) -> Self {
        Self {
            queue: FrameQueue::new(capacity),
            counters: WorkerCounters::default(),
            processing: AtomicBool::new(false),
            active: AtomicBool::new(true),
        }
    }
}

struct RunHandle {
    state: Arc<RunState>,
    events: Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

pub struct Pipeline {
    config: PipelineConfig,
    shared: Arc<Shared>,
    transform: Arc<Mutex<dyn FrameTransform>>,
    encoder: Arc<dyn FrameEncoder>,
    run: Mutex<Option<RunHandle>>,
    /// Run that `submit_frame` and `metrics` address; kept after `stop`.
    current: Mutex<Arc<RunState>>,
    running: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        transform: Arc<Mutex<dyn FrameTransform>>,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Self {
        let shared = Arc::new(Shared {
            latest: Arc::new(LatestFrame::new()),
            filter: AtomicU8::new(config.initial_filter.as_u8()),
        });
        let idle = RunState::new(config.queue_capacity);
        idle.active.store(false, Ordering::Release);
        Self {
            config,
            shared,
            transform,
            encoder,
            run: Mutex::new(None),
            current: Mutex::new(Arc::new(idle)),
            running: AtomicBool::new(false),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Arc<RunState> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the processing worker on a fresh queue with zeroed metrics.
    ///
    /// On failure nothing is left running and `is_running` stays false.
    pub fn start(&self) -> Result<()> {
        let mut run = self.lock_run();
        if run.is_some() {
            log::warn!("pipeline already running");
            return Ok(());
        }

        let state = Arc::new(RunState::new(self.config.queue_capacity));
        let (events_tx, events_rx) = mpsc::channel();
        let worker = ProcessingWorker {
            shared: self.shared.clone(),
            run: state.clone(),
            transform: self.transform.clone(),
            encoder: self.encoder.clone(),
            dequeue_wait: self.config.dequeue_wait,
            events: events_tx,
        };
        let join = std::thread::Builder::new()
            .name("relay-processing".into())
            .spawn(move || worker.run())
            .context("failed to spawn processing worker")?;

        match events_rx.recv_timeout(self.config.startup_timeout) {
            Ok(WorkerEvent::Alive) => {}
            Ok(WorkerEvent::Exited) | Err(_) => {
                state.active.store(false, Ordering::Release);
                return Err(anyhow!(
                    "processing worker did not come up within {:?}",
                    self.config.startup_timeout
                ));
            }
        }

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        *run = Some(RunHandle {
            state,
            events: events_rx,
            join,
        });
        self.running.store(true, Ordering::Release);
        log::info!(
            "pipeline started (queue capacity {}, filter {})",
            self.config.queue_capacity.max(1),
            self.active_filter()
        );
        Ok(())
    }

    /// Ask the worker to exit and wait up to the grace period.
    ///
    /// A worker that overruns the grace period is detached. Its run stays
    /// inactive, so whatever it finishes afterwards is discarded unpublished.
    pub fn stop(&self) {
        let Some(handle) = self.lock_run().take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        handle.state.active.store(false, Ordering::Release);

        match handle.events.recv_timeout(self.config.stop_grace) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join.join().is_err() {
                    log::error!("processing worker panicked");
                }
                log::info!("pipeline stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "processing worker still busy after {:?}; detaching",
                    self.config.stop_grace
                );
            }
        }
    }

    /// Hand a captured frame to the pipeline.
    ///
    /// Returns false only when the pipeline is not running. A full queue
    /// evicts its oldest frame instead of rejecting this one.
    pub fn submit_frame(&self, frame: RawFrame) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let id = frame.id;
        if let Admission::ReplacedOldest { evicted_id } = self.current().queue.try_enqueue(frame) {
            log::trace!("frame {} evicted by frame {}", evicted_id, id);
        }
        true
    }

    pub fn set_active_filter(&self, kind: FilterKind) {
        let previous = self.shared.filter.swap(kind.as_u8(), Ordering::AcqRel);
        if previous != kind.as_u8() {
            log::info!("filter changed to {}", kind);
        }
    }

    pub fn active_filter(&self) -> FilterKind {
        self.shared.active_filter()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True while the current run's worker is inside a transform/encode call.
    pub fn is_processing(&self) -> bool {
        self.current().processing.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let run = self.current();
        let (admitted, evicted, depth) = run.queue.counts();
        let failed = run.counters.failed();
        PipelineMetrics {
            frames_admitted: admitted,
            frames_processed: run.counters.processed(),
            frames_dropped: evicted + failed,
            frames_failed: failed,
            current_fps: run.counters.fps(),
            queue_depth: depth,
            is_running: self.is_running(),
            last_processing_ms: run.counters.last_processing_ms(),
        }
    }

    /// Zero the counters without touching the worker. Buffered frames are
    /// discarded with them so the admitted/processed/dropped balance restarts at zero.
    pub fn reset_metrics(&self) {
        let run = self.current();
        run.queue.reset();
        run.counters.reset();
    }

    /// Latest-frame cell the streaming server reads from.
    pub fn latest(&self) -> Arc<LatestFrame> {
        self.shared.latest.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl ControlHandler for Pipeline {
    fn apply_filter(&self, kind: FilterKind) {
        self.set_active_filter(kind);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
