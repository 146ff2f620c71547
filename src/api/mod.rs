//! Pull-based HTTP frame server.
//!
//! Routes:
//! - `GET /`: embedded viewer page.
//! - `GET /api/frame`: latest processed frame, or `204 No Content` before the first publish.
//! - `/api/control*`: acknowledged with `{"status":"ok"}`; a `filter=<kind>` query is
//!   forwarded to the configured `ControlHandler`.
//! - anything else: `404 Not Found`.
//!
//! One thread accepts, one thread per connection answers a single request and
//! closes. The accept loop polls a non-blocking listener so `stop` is seen
//! within one poll interval no matter what connection handlers are doing.

pub mod viewer;

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::FilterKind;
use crate::publish::LatestFrame;

pub use viewer::VIEWER_HTML;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Sleep between accept attempts when no connection is pending.
    pub accept_poll: Duration,
    /// Read/write timeout applied to every client socket.
    pub io_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            accept_poll: Duration::from_millis(50),
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// Receives control requests routed through `/api/control*`.
pub trait ControlHandler: Send + Sync {
    fn apply_filter(&self, kind: FilterKind);
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// In-flight connection handlers are not waited for; each one finishes
    /// (or times out) on its own thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("streaming server thread panicked"))?;
        }
        log::info!(
            "streaming server on {} stopped ({} connection(s) still draining)",
            self.addr,
            self.active_connections()
        );
        Ok(())
    }

    /// Connection handlers currently alive.
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub struct StreamingServer {
    cfg: ServerConfig,
    latest: Arc<LatestFrame>,
    control: Option<Arc<dyn ControlHandler>>,
}

struct ConnectionContext {
    latest: Arc<LatestFrame>,
    control: Option<Arc<dyn ControlHandler>>,
    io_timeout: Duration,
}

/// Decrements the live-connection count when a handler thread ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StreamingServer {
    pub fn new(cfg: ServerConfig, latest: Arc<LatestFrame>) -> Self {
        Self {
            cfg,
            latest,
            control: None,
        }
    }

    pub fn with_control(mut self, control: Arc<dyn ControlHandler>) -> Self {
        self.control = Some(control);
        self
    }

    /// Bind and start serving. A bind failure leaves nothing running.
    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid server address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind streaming server on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(ConnectionContext {
            latest: self.latest,
            control: self.control,
            io_timeout: self.cfg.io_timeout,
        });
        let accept_poll = self.cfg.accept_poll;
        let shutdown_thread = shutdown.clone();
        let connections_thread = connections.clone();
        let join = std::thread::Builder::new()
            .name("relay-http-accept".into())
            .spawn(move || {
                run_accept_loop(listener, ctx, accept_poll, shutdown_thread, connections_thread)
            })
            .context("failed to spawn streaming server thread")?;
        log::info!("streaming server listening on {}", addr);

        Ok(ServerHandle {
            addr,
            shutdown,
            connections,
            join: Some(join),
        })
    }
}

fn run_accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    accept_poll: Duration,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                connections.fetch_add(1, Ordering::SeqCst);
                let guard = ConnectionGuard(connections.clone());
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("relay-http-conn".into())
                    .spawn(move || {
                        let _guard = guard;
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not spawn handler for {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(accept_poll);
            }
            Err(err) => {
                log::warn!("accept failed: {}", err);
                std::thread::sleep(accept_poll);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Viewer,
    Frame,
    Control,
    NotFound,
}

impl Route {
    fn from_path(path: &str) -> Self {
        match path {
            "/" => Route::Viewer,
            "/api/frame" => Route::Frame,
            p if p.starts_with("/api/control") => Route::Control,
            _ => Route::NotFound,
        }
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(ctx.io_timeout))?;
    stream.set_write_timeout(Some(ctx.io_timeout))?;

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_response(&mut stream, &Response::text(400, "Bad Request"));
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.raw_path);

    let response = match Route::from_path(&request.path) {
        Route::Viewer => Response {
            status: 200,
            content_type: Some("text/html; charset=utf-8"),
            extra_headers: &[],
            body: VIEWER_HTML.as_bytes(),
        },
        Route::Frame => return serve_frame(&mut stream, &ctx.latest),
        Route::Control => {
            apply_control(&request, ctx.control.as_deref());
            Response::json(200, r#"{"status":"ok"}"#)
        }
        Route::NotFound => Response::text(404, "Not Found"),
    };
    write_response(&mut stream, &response)
}

fn serve_frame(stream: &mut TcpStream, latest: &LatestFrame) -> Result<()> {
    const NO_CACHE: &[(&str, &str)] = &[("Cache-Control", "no-cache"), ("Pragma", "no-cache")];
    let Some(frame) = latest.read_latest() else {
        return write_response(
            stream,
            &Response {
                status: 204,
                content_type: None,
                extra_headers: NO_CACHE,
                body: &[],
            },
        );
    };
    write_response(
        stream,
        &Response {
            status: 200,
            content_type: Some(frame.content_type()),
            extra_headers: NO_CACHE,
            body: frame.encoded_bytes(),
        },
    )
}

fn apply_control(request: &HttpRequest, control: Option<&dyn ControlHandler>) {
    let Some(query) = request.query() else {
        return;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key != "filter" {
            continue;
        }
        match value.parse::<FilterKind>() {
            Ok(kind) => match control {
                Some(handler) => handler.apply_filter(kind),
                None => log::debug!("control request for filter {} ignored; no handler", kind),
            },
            Err(err) => log::warn!("ignoring control request: {}", err),
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    parse_request(&data)
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    // Header lines are read off the socket but not needed for routing.
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
    })
}

struct Response<'a> {
    status: u16,
    content_type: Option<&'a str>,
    extra_headers: &'a [(&'a str, &'a str)],
    body: &'a [u8],
}

impl<'a> Response<'a> {
    fn text(status: u16, body: &'a str) -> Self {
        Self {
            status,
            content_type: Some("text/plain"),
            extra_headers: &[],
            body: body.as_bytes(),
        }
    }

    fn json(status: u16, body: &'a str) -> Self {
        Self {
            status,
            content_type: Some("application/json"),
            extra_headers: &[],
            body: body.as_bytes(),
        }
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(stream: &mut TcpStream, response: &Response<'_>) -> Result<()> {
    let mut header = String::with_capacity(160);
    header.push_str(status_line(response.status));
    header.push_str("\r\n");
    if let Some(content_type) = response.content_type {
        header.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    if response.status != 204 {
        header.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    for (name, value) in response.extra_headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("Connection: close\r\n\r\n");

    stream.write_all(header.as_bytes())?;
    if response.status != 204 {
        stream.write_all(response.body)?;
    }
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
}

impl HttpRequest {
    fn query(&self) -> Option<&str> {
        self.raw_path.split_once('?').map(|(_, query)| query)
    }
}
