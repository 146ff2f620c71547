use anyhow::{anyhow, Result};
use image::{DynamicImage, RgbImage};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use edge_relay::{
    CpuFilter, FilterKind, FrameTransform, JpegEncoder, PixelFormat, Pipeline, PipelineConfig,
    RawFrame, ServerConfig, StreamingServer,
};

/// Solid-color output after an optional delay; fails or panics on chosen ids.
struct ScriptedTransform {
    delay: Duration,
    fail_odd: bool,
    panic_on: Option<u64>,
}

impl ScriptedTransform {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_odd: false,
            panic_on: None,
        }
    }
}

impl FrameTransform for ScriptedTransform {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn apply(&mut self, _kind: FilterKind, frame: &RawFrame) -> Result<DynamicImage> {
        if self.panic_on == Some(frame.id) {
            panic!("scripted panic on frame {}", frame.id);
        }
        if self.fail_odd && frame.id % 2 == 1 {
            return Err(anyhow!("scripted failure on frame {}", frame.id));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(DynamicImage::ImageRgb8(RgbImage::new(frame.width, frame.height)))
    }
}

fn pipeline_with(transform: ScriptedTransform) -> Pipeline {
    Pipeline::new(
        PipelineConfig::default(),
        Arc::new(Mutex::new(transform)),
        Arc::new(JpegEncoder::default()),
    )
}

/// Pipeline whose transform takes 400ms per frame and whose stop grace is 50ms.
fn slow_pipeline() -> Pipeline {
    Pipeline::new(
        PipelineConfig {
            stop_grace: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
        Arc::new(Mutex::new(ScriptedTransform {
            delay: Duration::from_millis(400),
            ..ScriptedTransform::new()
        })),
        Arc::new(JpegEncoder::default()),
    )
}

fn frame(id: u64) -> RawFrame {
    RawFrame::new(id, vec![128u8; 8 * 6 * 3], 8, 6, PixelFormat::Rgb24)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn restart_resets_metrics_and_keeps_last_frame() -> Result<()> {
    let pipeline = pipeline_with(ScriptedTransform::new());
    pipeline.start()?;
    for id in 1..=3 {
        assert!(pipeline.submit_frame(frame(id)));
    }
    assert!(wait_for(|| pipeline.metrics().frames_processed >= 1));
    pipeline.stop();
    assert!(!pipeline.metrics().is_running);
    assert!(!pipeline.submit_frame(frame(4)));

    pipeline.start()?;
    let metrics = pipeline.metrics();
    assert!(metrics.is_running);
    assert_eq!(metrics.frames_admitted, 0);
    assert_eq!(metrics.frames_processed, 0);
    assert_eq!(metrics.frames_dropped, 0);
    assert_eq!(metrics.frames_failed, 0);
    assert_eq!(metrics.queue_depth, 0);
    assert!(pipeline.latest().read_latest().is_some());
    pipeline.stop();
    Ok(())
}

#[test]
fn stop_gives_up_on_busy_worker_after_grace() -> Result<()> {
    let pipeline = slow_pipeline();
    pipeline.start()?;
    assert!(pipeline.submit_frame(frame(1)));
    assert!(wait_for(|| pipeline.is_processing()));

    let started = Instant::now();
    pipeline.stop();
    let waited = started.elapsed();
    assert!(waited < Duration::from_millis(300), "stop took {:?}", waited);
    assert!(!pipeline.is_running());
    assert!(!pipeline.submit_frame(frame(2)));
    Ok(())
}

#[test]
fn restart_after_detached_worker_starts_clean() -> Result<()> {
    let pipeline = slow_pipeline();
    pipeline.start()?;
    assert!(pipeline.submit_frame(frame(1)));
    assert!(wait_for(|| pipeline.is_processing()));
    pipeline.stop();

    pipeline.start()?;
    // Outlast the detached worker's in-flight frame.
    std::thread::sleep(Duration::from_millis(700));

    let metrics = pipeline.metrics();
    assert!(metrics.is_running);
    assert_eq!(
        metrics.frames_admitted,
        metrics.frames_processed + metrics.frames_dropped + metrics.queue_depth as u64
    );
    assert_eq!(metrics.frames_admitted, 0);
    assert_eq!(metrics.frames_processed, 0);
    assert_eq!(metrics.frames_dropped, 0);
    assert!(!pipeline.is_processing());
    assert!(pipeline.latest().read_latest().is_none());

    assert!(pipeline.submit_frame(frame(2)));
    assert!(wait_for(|| pipeline.metrics().frames_processed == 1));
    assert_eq!(
        pipeline.latest().read_latest().map(|f| f.source_frame_id()),
        Some(2)
    );
    pipeline.stop();
    Ok(())
}

#[test]
fn start_fails_cleanly_when_worker_never_reports() -> Result<()> {
    let transform = Arc::new(Mutex::new(ScriptedTransform::new()));
    let pipeline = Pipeline::new(
        PipelineConfig {
            startup_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
        transform.clone(),
        Arc::new(JpegEncoder::default()),
    );

    // The worker cannot report alive while the transform is held elsewhere.
    let held = transform.lock().map_err(|_| anyhow!("transform poisoned"))?;
    assert!(pipeline.start().is_err());
    assert!(!pipeline.is_running());
    assert!(!pipeline.submit_frame(frame(1)));
    drop(held);

    pipeline.start()?;
    assert!(pipeline.is_running());
    assert!(pipeline.submit_frame(frame(2)));
    assert!(wait_for(|| pipeline.metrics().frames_processed == 1));
    pipeline.stop();
    Ok(())
}

#[test]
fn burst_keeps_accounting_balanced() -> Result<()> {
    let pipeline = pipeline_with(ScriptedTransform {
        delay: Duration::from_millis(5),
        ..ScriptedTransform::new()
    });
    pipeline.start()?;
    for id in 1..=20 {
        assert!(pipeline.submit_frame(frame(id)));
    }

    assert!(wait_for(|| {
        let m = pipeline.metrics();
        m.queue_depth == 0
            && !pipeline.is_processing()
            && m.frames_processed + m.frames_dropped == m.frames_admitted
    }));
    let metrics = pipeline.metrics();
    assert_eq!(metrics.frames_admitted, 20);
    assert!(metrics.frames_dropped >= 1);
    assert_eq!(metrics.frames_failed, 0);
    pipeline.stop();
    Ok(())
}

#[test]
fn failing_frames_are_discarded_and_worker_continues() -> Result<()> {
    let pipeline = pipeline_with(ScriptedTransform {
        fail_odd: true,
        ..ScriptedTransform::new()
    });
    pipeline.start()?;
    for id in 1..=4 {
        assert!(pipeline.submit_frame(frame(id)));
        assert!(wait_for(|| {
            let m = pipeline.metrics();
            m.frames_processed + m.frames_failed == id
        }));
    }

    let metrics = pipeline.metrics();
    assert_eq!(metrics.frames_processed, 2);
    assert_eq!(metrics.frames_failed, 2);
    assert_eq!(metrics.frames_dropped, 2);
    assert!(metrics.is_running);
    let latest = pipeline.latest().read_latest().expect("published frame");
    assert_eq!(latest.source_frame_id(), 4);
    pipeline.stop();
    Ok(())
}

#[test]
fn panicking_transform_does_not_kill_worker() -> Result<()> {
    let pipeline = pipeline_with(ScriptedTransform {
        panic_on: Some(1),
        ..ScriptedTransform::new()
    });
    pipeline.start()?;
    assert!(pipeline.submit_frame(frame(1)));
    assert!(wait_for(|| pipeline.metrics().frames_failed == 1));
    assert!(pipeline.submit_frame(frame(2)));
    assert!(wait_for(|| pipeline.metrics().frames_processed == 1));
    assert_eq!(
        pipeline.latest().read_latest().map(|f| f.source_frame_id()),
        Some(2)
    );
    pipeline.stop();
    Ok(())
}

#[test]
fn readers_only_see_submitted_ids() -> Result<()> {
    let pipeline = Arc::new(pipeline_with(ScriptedTransform::new()));
    pipeline.start()?;

    let submitted: HashSet<u64> = (1..=200).map(|n| n * 3).collect();
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let latest = pipeline.latest();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            while !done.load(Ordering::Acquire) {
                if let Some(frame) = latest.read_latest() {
                    seen.push(frame.source_frame_id());
                }
            }
            seen
        })
    };

    let mut ids: Vec<u64> = submitted.iter().copied().collect();
    ids.sort_unstable();
    for id in ids {
        pipeline.submit_frame(frame(id));
    }
    assert!(wait_for(|| {
        let m = pipeline.metrics();
        m.queue_depth == 0 && m.frames_processed + m.frames_dropped == m.frames_admitted
    }));
    done.store(true, Ordering::Release);
    let seen = reader.join().map_err(|_| anyhow!("reader panicked"))?;

    assert!(seen.iter().all(|id| submitted.contains(id)));
    pipeline.stop();
    Ok(())
}

#[test]
fn processed_frames_reach_http_viewers() -> Result<()> {
    let pipeline = Arc::new(Pipeline::new(
        PipelineConfig {
            initial_filter: FilterKind::Grayscale,
            ..PipelineConfig::default()
        },
        Arc::new(Mutex::new(CpuFilter::new())),
        Arc::new(JpegEncoder::default()),
    ));
    pipeline.start()?;
    let server = StreamingServer::new(
        ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            accept_poll: Duration::from_millis(20),
            io_timeout: Duration::from_secs(2),
        },
        pipeline.latest(),
    )
    .spawn()?;

    assert!(pipeline.submit_frame(frame(1)));
    assert!(wait_for(|| pipeline.latest().read_latest().is_some()));

    let mut stream = TcpStream::connect(server.addr)?;
    stream.write_all(b"GET /api/frame HTTP/1.1\r\nHost: relay\r\n\r\n")?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("no header terminator"))?;
    assert!(raw.starts_with(b"HTTP/1.1 200 OK"));
    let decoded = image::load_from_memory(&raw[split + 4..])?;
    assert_eq!((decoded.width(), decoded.height()), (8, 6));

    server.stop()?;
    pipeline.stop();
    Ok(())
}
