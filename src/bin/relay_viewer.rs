//! relay_viewer - headless viewer for an edge relay
//!
//! Pulls frames with the same loop a browser viewer runs, logs throughput,
//! and optionally writes the last rendered frame to disk on exit.

use anyhow::{Context, Result};
use clap::Parser;
use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use edge_relay::{ClientStreamLoop, FrameSink, HttpFrameFetcher, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pull frames from an edge relay")]
struct Args {
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Relay base URL, e.g. http://127.0.0.1:8080.
    #[arg(long)]
    url: Option<String>,

    /// Write the last rendered frame here (JPEG) on exit.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

/// Logs rendered frames once per second and keeps the newest one for snapshots.
struct LoggingSink {
    keep_last: bool,
    last: Option<DynamicImage>,
    since_log: u64,
    last_log: Instant,
}

impl LoggingSink {
    fn new(keep_last: bool) -> Self {
        Self {
            keep_last,
            last: None,
            since_log: 0,
            last_log: Instant::now(),
        }
    }
}

impl FrameSink for LoggingSink {
    fn render(&mut self, frame: &DynamicImage) -> Result<()> {
        self.since_log += 1;
        if self.last_log.elapsed() >= Duration::from_secs(1) {
            log::info!(
                "rendered {} frame(s), latest {}x{}",
                self.since_log,
                frame.width(),
                frame.height()
            );
            self.since_log = 0;
            self.last_log = Instant::now();
        }
        if self.keep_last {
            self.last = Some(frame.clone());
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    cfg.apply_env()?;
    if let Some(url) = &args.url {
        cfg.client.url = url.clone();
    }
    cfg.validate()?;
    let client_cfg = cfg.client_config();

    let fetcher = HttpFrameFetcher::new(&client_cfg.url, client_cfg.request_timeout)?;
    log::info!("viewing {}", fetcher.url());
    let sink = LoggingSink::new(args.snapshot.is_some());
    let mut stream = ClientStreamLoop::new(fetcher, sink, client_cfg);

    let control = stream.control();
    ctrlc::set_handler(move || control.stop()).expect("error setting Ctrl-C handler");

    if let Some(secs) = args.duration_secs {
        let control = stream.control();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            control.stop();
        });
    }

    stream.start();
    log::info!("client metrics {}", serde_json::to_string(&stream.metrics())?);

    if let Some(path) = &args.snapshot {
        match stream.sink().last.as_ref() {
            Some(frame) => {
                frame
                    .save_with_format(path, ImageFormat::Jpeg)
                    .with_context(|| format!("write snapshot {}", path.display()))?;
                log::info!("snapshot written to {}", path.display());
            }
            None => log::warn!("no frame rendered; snapshot skipped"),
        }
    }
    Ok(())
}
