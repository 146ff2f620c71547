//! Viewer-side streaming loop.
//!
//! `ClientStreamLoop` repeatedly pulls the newest frame from a relay, decodes
//! it, and hands it to a `FrameSink`. It runs on the caller's thread and
//! yields through a `Pacer` between iterations. `StreamControl` is the
//! cloneable handle other threads use to stop it or read its metrics.

mod http;

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::pipeline::FpsWindow;

pub use http::HttpFrameFetcher;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Relay base URL; the frame route is joined onto it.
    pub url: String,
    /// Sleep after a transport failure before the next attempt.
    pub backoff: Duration,
    /// Pacing between iterations.
    pub frame_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            backoff: Duration::from_millis(500),
            frame_interval: Duration::from_millis(16),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Result of one frame request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Frame(Vec<u8>),
    /// The relay has not published anything yet (HTTP 204).
    NotReady,
}

/// Source of encoded frames. `Err` means a transport failure.
pub trait FrameFetcher {
    fn fetch(&mut self) -> Result<FetchOutcome>;
}

/// Render target for decoded frames.
pub trait FrameSink {
    fn render(&mut self, frame: &DynamicImage) -> Result<()>;
}

/// Yield point between loop iterations.
pub trait Pacer {
    /// Called once after every completed iteration.
    fn wait_next(&mut self);

    /// Called after a transport failure.
    fn backoff(&mut self, delay: Duration);
}

/// Fixed-cadence pacer: sleeps for whatever is left of the interval.
pub struct IntervalPacer {
    interval: Duration,
    last_tick: Instant,
}

impl IntervalPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: Instant::now(),
        }
    }
}

impl Pacer for IntervalPacer {
    fn wait_next(&mut self) {
        let spent = self.last_tick.elapsed();
        if spent < self.interval {
            std::thread::sleep(self.interval - spent);
        }
        self.last_tick = Instant::now();
    }

    fn backoff(&mut self, delay: Duration) {
        std::thread::sleep(delay);
        self.last_tick = Instant::now();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    pub frames_fetched: u64,
    pub frames_rendered: u64,
    /// Running mean across every rendered frame, fetch plus decode plus render.
    pub average_latency_ms: f64,
    pub peak_fps: f64,
    /// Frames contributing to the latency mean; survives stop/start.
    pub total_frames: u64,
    pub current_fps: f64,
    pub is_streaming: bool,
    pub transport_failures: u64,
}

/// Cloneable handle onto a running loop.
#[derive(Clone, Default)]
pub struct StreamControl {
    streaming: Arc<AtomicBool>,
    /// Set by a `stop` that lands while the loop is not streaming.
    stop_pending: Arc<AtomicBool>,
    metrics: Arc<Mutex<ClientMetrics>>,
}

impl StreamControl {
    /// Observed at the top of the next iteration; an in-flight fetch completes.
    ///
    /// A stop issued before the loop starts cancels that next `start`.
    pub fn stop(&self) {
        let mut metrics = self.lock_metrics();
        if !self.streaming.swap(false, Ordering::AcqRel) {
            self.stop_pending.store(true, Ordering::Release);
        }
        metrics.is_streaming = false;
    }

    fn halt(&self) {
        let mut metrics = self.lock_metrics();
        self.streaming.store(false, Ordering::Release);
        metrics.is_streaming = false;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> ClientMetrics {
        self.lock_metrics().clone()
    }

    fn lock_metrics(&self) -> MutexGuard<'_, ClientMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ClientStreamLoop<F, S, P = IntervalPacer> {
    fetcher: F,
    sink: S,
    pacer: P,
    backoff: Duration,
    control: StreamControl,
    window: FpsWindow,
}

impl<F: FrameFetcher, S: FrameSink> ClientStreamLoop<F, S, IntervalPacer> {
    pub fn new(fetcher: F, sink: S, config: ClientConfig) -> Self {
        Self::with_pacer(fetcher, sink, IntervalPacer::new(config.frame_interval), config.backoff)
    }
}

impl<F: FrameFetcher, S: FrameSink, P: Pacer> ClientStreamLoop<F, S, P> {
    pub fn with_pacer(fetcher: F, sink: S, pacer: P, backoff: Duration) -> Self {
        Self {
            fetcher,
            sink,
            pacer,
            backoff,
            control: StreamControl::default(),
            window: FpsWindow::new(),
        }
    }

    /// Stream until `stop` is called on this loop or any `StreamControl` clone.
    pub fn start(&mut self) {
        {
            let mut metrics = self.control.lock_metrics();
            if self.control.stop_pending.swap(false, Ordering::AcqRel) {
                log::info!("client stream stopped before it started");
                return;
            }
            if self.control.streaming.swap(true, Ordering::AcqRel) {
                log::warn!("client stream already running");
                return;
            }
            metrics.is_streaming = true;
            metrics.frames_fetched = 0;
            metrics.frames_rendered = 0;
        }
        self.window = FpsWindow::new();
        log::info!("client stream started");

        while self.control.is_streaming() {
            let started = Instant::now();
            match self.fetch_and_render() {
                Ok(true) => self.record_rendered(started.elapsed()),
                Ok(false) => {}
                Err(err) => {
                    self.control.lock_metrics().transport_failures += 1;
                    log::warn!("frame fetch failed: {:#}; retrying in {:?}", err, self.backoff);
                    self.pacer.backoff(self.backoff);
                    continue;
                }
            }
            self.pacer.wait_next();
        }
        self.control.lock_metrics().is_streaming = false;
        log::info!("client stream stopped");
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn control(&self) -> StreamControl {
        self.control.clone()
    }

    pub fn metrics(&self) -> ClientMetrics {
        self.control.metrics()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Stop streaming and zero every metric, including the FPS window.
    pub fn reset(&mut self) {
        self.control.halt();
        *self.control.lock_metrics() = ClientMetrics::default();
        self.window = FpsWindow::new();
    }

    /// Start when stopped. When called on a stopped loop this blocks like `start`.
    pub fn toggle(&mut self) {
        if self.control.is_streaming() {
            self.stop();
        } else {
            self.start();
        }
    }

    /// Ok(true) when a frame reached the sink, Ok(false) on "not ready" or a
    /// sink error. Err is a transport or decode failure.
    fn fetch_and_render(&mut self) -> Result<bool> {
        let bytes = match self.fetcher.fetch()? {
            FetchOutcome::NotReady => return Ok(false),
            FetchOutcome::Frame(bytes) => bytes,
        };
        self.control.lock_metrics().frames_fetched += 1;
        let image = image::load_from_memory(&bytes).context("decode frame")?;
        if let Err(err) = self.sink.render(&image) {
            log::warn!("render failed: {:#}", err);
            return Ok(false);
        }
        Ok(true)
    }

    fn record_rendered(&mut self, latency: Duration) {
        self.window.record();
        let fps = self.window.roll();
        let mut metrics = self.control.lock_metrics();
        metrics.frames_rendered += 1;
        metrics.total_frames += 1;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        metrics.average_latency_ms +=
            (latency_ms - metrics.average_latency_ms) / metrics.total_frames as f64;
        if let Some(fps) = fps {
            metrics.current_fps = fps;
            if fps > metrics.peak_fps {
                metrics.peak_fps = fps;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use image::{ImageFormat, RgbImage};
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Replays a fixed script, then stops the loop.
    struct ScriptedFetcher {
        script: VecDeque<Result<FetchOutcome>>,
        control: Option<StreamControl>,
        calls: usize,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchOutcome>>) -> Self {
            Self {
                script: script.into(),
                control: None,
                calls: 0,
            }
        }
    }

    impl FrameFetcher for ScriptedFetcher {
        fn fetch(&mut self) -> Result<FetchOutcome> {
            self.calls += 1;
            match self.script.pop_front() {
                Some(step) => step,
                None => {
                    if let Some(control) = &self.control {
                        control.stop();
                    }
                    Ok(FetchOutcome::NotReady)
                }
            }
        }
    }

    #[derive(Default)]
    struct CountingSink {
        rendered: Vec<(u32, u32)>,
    }

    impl FrameSink for CountingSink {
        fn render(&mut self, frame: &DynamicImage) -> Result<()> {
            self.rendered.push((frame.width(), frame.height()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPacer {
        ticks: usize,
        backoffs: Vec<Duration>,
    }

    impl Pacer for RecordingPacer {
        fn wait_next(&mut self) {
            self.ticks += 1;
        }

        fn backoff(&mut self, delay: Duration) {
            self.backoffs.push(delay);
        }
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut out, ImageFormat::Jpeg)
            .expect("encode jpeg");
        out.into_inner()
    }

    fn scripted_loop(
        script: Vec<Result<FetchOutcome>>,
    ) -> ClientStreamLoop<ScriptedFetcher, CountingSink, RecordingPacer> {
        let mut client = ClientStreamLoop::with_pacer(
            ScriptedFetcher::new(script),
            CountingSink::default(),
            RecordingPacer::default(),
            Duration::from_millis(500),
        );
        client.fetcher.control = Some(client.control());
        client
    }

    #[test]
    fn not_ready_responses_leave_metrics_untouched() {
        let mut client = scripted_loop(vec![
            Ok(FetchOutcome::NotReady),
            Ok(FetchOutcome::NotReady),
            Ok(FetchOutcome::NotReady),
        ]);
        client.start();

        let metrics = client.metrics();
        assert_eq!(metrics.frames_rendered, 0);
        assert_eq!(metrics.average_latency_ms, 0.0);
        assert_eq!(metrics.transport_failures, 0);
        assert!(!metrics.is_streaming);
        assert!(client.pacer.backoffs.is_empty());
        assert_eq!(client.pacer.ticks, 4);
    }

    #[test]
    fn transport_failure_backs_off_and_continues() {
        let mut client = scripted_loop(vec![
            Err(anyhow!("connection refused")),
            Ok(FetchOutcome::Frame(jpeg_bytes(4, 3))),
        ]);
        client.start();

        let metrics = client.metrics();
        assert_eq!(metrics.transport_failures, 1);
        assert_eq!(metrics.frames_rendered, 1);
        assert_eq!(client.pacer.backoffs, vec![Duration::from_millis(500)]);
        assert_eq!(client.sink.rendered, vec![(4, 3)]);
    }

    #[test]
    fn undecodable_body_is_a_transport_failure() {
        let mut client = scripted_loop(vec![Ok(FetchOutcome::Frame(vec![1, 2, 3]))]);
        client.start();

        let metrics = client.metrics();
        assert_eq!(metrics.frames_fetched, 1);
        assert_eq!(metrics.frames_rendered, 0);
        assert_eq!(metrics.transport_failures, 1);
        assert_eq!(client.pacer.backoffs.len(), 1);
    }

    #[test]
    fn rendered_frames_feed_latency_average() {
        let mut client = scripted_loop(vec![
            Ok(FetchOutcome::Frame(jpeg_bytes(2, 2))),
            Ok(FetchOutcome::NotReady),
            Ok(FetchOutcome::Frame(jpeg_bytes(2, 2))),
        ]);
        client.start();

        let metrics = client.metrics();
        assert_eq!(metrics.frames_rendered, 2);
        assert_eq!(metrics.total_frames, 2);
        assert!(metrics.average_latency_ms >= 0.0);
    }

    #[test]
    fn loop_exits_once_stopped() {
        let mut client = scripted_loop(vec![]);
        client.start();
        assert_eq!(client.fetcher.calls, 1);
        assert!(!client.control().is_streaming());
    }

    #[test]
    fn stop_before_start_cancels_only_that_start() {
        let mut client = scripted_loop(vec![Ok(FetchOutcome::Frame(jpeg_bytes(2, 2)))]);
        client.control().stop();
        client.start();
        assert_eq!(client.fetcher.calls, 0);
        assert!(!client.metrics().is_streaming);

        client.start();
        assert_eq!(client.metrics().frames_rendered, 1);
        assert!(client.fetcher.calls >= 1);
    }

    #[test]
    fn reset_zeroes_metrics() {
        let mut client = scripted_loop(vec![Ok(FetchOutcome::Frame(jpeg_bytes(2, 2)))]);
        client.start();
        assert_eq!(client.metrics().total_frames, 1);
        client.reset();
        assert_eq!(client.metrics(), ClientMetrics::default());

        client.fetcher.script.push_back(Ok(FetchOutcome::Frame(jpeg_bytes(2, 2))));
        client.start();
        assert_eq!(client.metrics().frames_rendered, 1);
    }
}
