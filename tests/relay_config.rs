use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use edge_relay::config::RelayConfig;
use edge_relay::FilterKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RELAY_CONFIG",
        "RELAY_ADDR",
        "RELAY_FILTER",
        "RELAY_QUEUE_CAPACITY",
        "RELAY_TARGET_FPS",
        "RELAY_JPEG_QUALITY",
        "RELAY_CLIENT_URL",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(
        br#"
[server]
addr = "127.0.0.1:9100"
accept_poll_ms = 25

[pipeline]
queue_capacity = 3
filter = "passthrough"
jpeg_quality = 70

[capture]
width = 320
height = 240
target_fps = 15

[client]
url = "http://relay.local:9100"
backoff_ms = 250
"#,
    )
    .expect("write config");

    std::env::set_var("RELAY_CONFIG", file.path());
    std::env::set_var("RELAY_FILTER", "gray");
    std::env::set_var("RELAY_QUEUE_CAPACITY", "5");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.server.addr, "127.0.0.1:9100");
    assert_eq!(cfg.server.accept_poll, Duration::from_millis(25));
    assert_eq!(cfg.server.io_timeout, Duration::from_millis(2000));
    assert_eq!(cfg.pipeline.queue_capacity, 5);
    assert_eq!(cfg.pipeline.filter, FilterKind::Grayscale);
    assert_eq!(cfg.pipeline.jpeg_quality, 70);
    assert_eq!(cfg.capture.width, 320);
    assert_eq!(cfg.capture.height, 240);
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!(cfg.client.url, "http://relay.local:9100");
    assert_eq!(cfg.client.backoff, Duration::from_millis(250));
    assert_eq!(cfg.client.frame_interval, Duration::from_millis(16));

    clear_env();
}

#[test]
fn loads_json_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp config");
    file.write_all(br#"{ "server": { "addr": "127.0.0.1:9200" }, "pipeline": { "filter": "edge" } }"#)
        .expect("write config");
    std::env::set_var("RELAY_CONFIG", file.path());

    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.server.addr, "127.0.0.1:9200");
    assert_eq!(cfg.pipeline.filter, FilterKind::EdgeDetect);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    std::env::set_var("RELAY_ADDR", "127.0.0.1:18080");
    std::env::set_var("RELAY_TARGET_FPS", "60");

    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.server.addr, "127.0.0.1:18080");
    assert_eq!(cfg.capture.target_fps, 60);
    assert_eq!(cfg.pipeline.queue_capacity, 2);
    assert_eq!(cfg.pipeline.filter, FilterKind::EdgeDetect);

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("RELAY_QUEUE_CAPACITY", "0");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("RELAY_JPEG_QUALITY", "loud");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("RELAY_FILTER", "sepia");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("RELAY_CLIENT_URL", "not a url");
    assert!(RelayConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    std::env::set_var("RELAY_CONFIG", "/nonexistent/edge-relay.toml");
    assert!(RelayConfig::load().is_err());
    clear_env();
}
