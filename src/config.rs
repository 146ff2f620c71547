use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::api::ServerConfig;
use crate::client::ClientConfig;
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::frame::{FilterKind, DEFAULT_QUEUE_CAPACITY};
use crate::pipeline::PipelineConfig;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_ACCEPT_POLL_MS: u64 = 50;
const DEFAULT_IO_TIMEOUT_MS: u64 = 2000;
const DEFAULT_DEQUEUE_WAIT_MS: u64 = 10;
const DEFAULT_STOP_GRACE_MS: u64 = 2000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_CAPTURE_FPS: u32 = 30;
const DEFAULT_CLIENT_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_BACKOFF_MS: u64 = 500;
const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    server: Option<ServerConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    capture: Option<CaptureConfigFile>,
    client: Option<ClientConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
    addr: Option<String>,
    accept_poll_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    queue_capacity: Option<usize>,
    dequeue_wait_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    startup_timeout_ms: Option<u64>,
    filter: Option<String>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClientConfigFile {
    url: Option<String>,
    backoff_ms: Option<u64>,
    frame_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub pipeline: PipelineSettings,
    pub capture: CaptureSettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    pub accept_poll: Duration,
    pub io_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub dequeue_wait: Duration,
    pub stop_grace: Duration,
    pub startup_timeout: Duration,
    pub filter: FilterKind,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub backoff: Duration,
    pub frame_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::with_filter(RelayConfigFile::default(), FilterKind::default())
    }
}

impl RelayConfig {
    /// Defaults, then the file named by `RELAY_CONFIG`, then `RELAY_*` overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var("RELAY_CONFIG").ok().filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML file (or JSON, by `.json` extension). Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::resolve(read_config_file(path)?)
    }

    fn resolve(file: RelayConfigFile) -> Result<Self> {
        let filter = match file.pipeline.as_ref().and_then(|p| p.filter.as_deref()) {
            Some(name) => name
                .parse::<FilterKind>()
                .map_err(|e| anyhow!("pipeline.filter: {}", e))?,
            None => FilterKind::default(),
        };
        Ok(Self::with_filter(file, filter))
    }

    fn with_filter(file: RelayConfigFile, filter: FilterKind) -> Self {
        let server = file.server.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let client = file.client.unwrap_or_default();

        Self {
            server: ServerSettings {
                addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
                accept_poll: millis(server.accept_poll_ms, DEFAULT_ACCEPT_POLL_MS),
                io_timeout: millis(server.io_timeout_ms, DEFAULT_IO_TIMEOUT_MS),
            },
            pipeline: PipelineSettings {
                queue_capacity: pipeline.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                dequeue_wait: millis(pipeline.dequeue_wait_ms, DEFAULT_DEQUEUE_WAIT_MS),
                stop_grace: millis(pipeline.stop_grace_ms, DEFAULT_STOP_GRACE_MS),
                startup_timeout: millis(pipeline.startup_timeout_ms, DEFAULT_STARTUP_TIMEOUT_MS),
                filter,
                jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            capture: CaptureSettings {
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            },
            client: ClientSettings {
                url: client.url.unwrap_or_else(|| DEFAULT_CLIENT_URL.to_string()),
                backoff: millis(client.backoff_ms, DEFAULT_BACKOFF_MS),
                frame_interval: millis(client.frame_interval_ms, DEFAULT_FRAME_INTERVAL_MS),
                request_timeout: millis(client.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS),
            },
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_nonempty("RELAY_ADDR") {
            self.server.addr = addr;
        }
        if let Some(filter) = env_nonempty("RELAY_FILTER") {
            self.pipeline.filter = filter
                .parse()
                .map_err(|e| anyhow!("RELAY_FILTER: {}", e))?;
        }
        if let Some(capacity) = env_nonempty("RELAY_QUEUE_CAPACITY") {
            self.pipeline.queue_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("RELAY_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Some(fps) = env_nonempty("RELAY_TARGET_FPS") {
            self.capture.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("RELAY_TARGET_FPS must be a positive integer"))?;
        }
        if let Some(quality) = env_nonempty("RELAY_JPEG_QUALITY") {
            self.pipeline.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("RELAY_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        if let Some(url) = env_nonempty("RELAY_CLIENT_URL") {
            self.client.url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .addr
            .parse::<SocketAddr>()
            .with_context(|| format!("server.addr '{}' is not a socket address", self.server.addr))?;
        if self.pipeline.queue_capacity == 0 {
            return Err(anyhow!("pipeline.queue_capacity must be at least 1"));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("pipeline.jpeg_quality must be within 1..=100"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture dimensions must be positive"));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture.target_fps must be positive"));
        }
        for (name, value) in [
            ("server.accept_poll_ms", self.server.accept_poll),
            ("server.io_timeout_ms", self.server.io_timeout),
            ("pipeline.dequeue_wait_ms", self.pipeline.dequeue_wait),
            ("pipeline.stop_grace_ms", self.pipeline.stop_grace),
            ("pipeline.startup_timeout_ms", self.pipeline.startup_timeout),
            ("client.backoff_ms", self.client.backoff),
            ("client.frame_interval_ms", self.client.frame_interval),
            ("client.request_timeout_ms", self.client.request_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        url::Url::parse(&self.client.url)
            .with_context(|| format!("client.url '{}' is not a valid URL", self.client.url))?;
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.pipeline.queue_capacity,
            dequeue_wait: self.pipeline.dequeue_wait,
            stop_grace: self.pipeline.stop_grace,
            startup_timeout: self.pipeline.startup_timeout,
            initial_filter: self.pipeline.filter,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.server.addr.clone(),
            accept_poll: self.server.accept_poll,
            io_timeout: self.server.io_timeout,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            url: self.client.url.clone(),
            backoff: self.client.backoff,
            frame_interval: self.client.frame_interval,
            request_timeout: self.client.request_timeout,
        }
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
