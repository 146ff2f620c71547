//! edge_relay - camera frame relay daemon
//!
//! This daemon:
//! 1. Captures frames from the synthetic test-pattern source
//! 2. Filters and JPEG-encodes them on the processing worker
//! 3. Serves the newest frame (and the viewer page) over HTTP
//! 4. Logs pipeline metrics until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edge_relay::{
    CaptureDriver, ControlHandler, CpuFilter, FilterKind, JpegEncoder, Pipeline, RelayConfig,
    StreamingServer, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay camera frames to pull-based HTTP viewers")]
struct Args {
    /// TOML (or .json) config file. Environment overrides apply on top.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080.
    #[arg(long)]
    addr: Option<String>,

    /// Initial filter: grayscale, edge_detect or passthrough.
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Capture rate of the synthetic source.
    #[arg(long)]
    target_fps: Option<u32>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    jpeg_quality: Option<u8>,

    /// Seconds between metrics log lines.
    #[arg(long, default_value_t = 5)]
    metrics_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = resolve_config(&args)?;

    let encoder = JpegEncoder::new(cfg.pipeline.jpeg_quality)?;
    let pipeline = Arc::new(Pipeline::new(
        cfg.pipeline_config(),
        Arc::new(Mutex::new(CpuFilter::new())),
        Arc::new(encoder),
    ));
    pipeline.start()?;

    let control: Arc<dyn ControlHandler> = pipeline.clone();
    let server = match StreamingServer::new(cfg.server_config(), pipeline.latest())
        .with_control(control)
        .spawn()
    {
        Ok(server) => server,
        Err(err) => {
            pipeline.stop();
            return Err(err);
        }
    };

    let source = SyntheticSource::new(cfg.capture.width, cfg.capture.height);
    let capture = match CaptureDriver::spawn(Box::new(source), pipeline.clone(), cfg.capture.target_fps)
    {
        Ok(capture) => capture,
        Err(err) => {
            server.stop()?;
            pipeline.stop();
            return Err(err);
        }
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("edge_relay running; Ctrl-C to stop");
    let interval = Duration::from_secs(args.metrics_interval_secs.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !capture.is_active() {
                    log::warn!("capture has stopped; viewers keep the last frame");
                }
                let metrics = pipeline.metrics();
                log::info!(
                    "metrics captured={} {}",
                    capture.frames_captured(),
                    serde_json::to_string(&metrics)?
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping...");
    capture.stop();
    server.stop()?;
    pipeline.stop();
    log::info!("final metrics {}", serde_json::to_string(&pipeline.metrics())?);
    Ok(())
}

fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let mut cfg = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    cfg.apply_env()?;

    if let Some(addr) = &args.addr {
        cfg.server.addr = addr.clone();
    }
    if let Some(filter) = &args.filter {
        cfg.pipeline.filter = filter
            .parse::<FilterKind>()
            .map_err(|e| anyhow!("--filter: {}", e))?;
    }
    if let Some(capacity) = args.queue_capacity {
        cfg.pipeline.queue_capacity = capacity;
    }
    if let Some(fps) = args.target_fps {
        cfg.capture.target_fps = fps;
    }
    if let Some(width) = args.width {
        cfg.capture.width = width;
    }
    if let Some(height) = args.height {
        cfg.capture.height = height;
    }
    if let Some(quality) = args.jpeg_quality {
        cfg.pipeline.jpeg_quality = quality;
    }
    cfg.validate()?;
    Ok(cfg)
}
