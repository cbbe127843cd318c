use crate::config::DEFAULT_API_ADDR;
use crate::processor::LatestDetection;
use crate::stream::CONTENT_TYPE as MJPEG_CONTENT_TYPE;
use crate::{ErrorKind, StartOutcome, StopOutcome, WatchError, Watcher};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const ROUTES: &[&str] = &[
    "/",
    "/webcam",
    "/status",
    "/detection",
    "/detections",
    "/latest-detection-image",
    "/video",
    "/pi-video",
    "/test-pi-connection",
];

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Streams already being served run until their viewer leaves.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    watcher: Watcher,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, watcher: Watcher) -> Self {
        Self { cfg, watcher }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let watcher = self.watcher;
        let join = std::thread::Builder::new()
            .name("troopwatch-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, watcher, shutdown_thread) {
                    log::error!("api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, watcher: Watcher, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let watcher = watcher.clone();
                let spawned = std::thread::Builder::new()
                    .name("troopwatch-http".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &watcher) {
                            log::warn!("api request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api: cannot spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, watcher: &Watcher) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, &json!({"error": "malformed request"}))?;
            return Err(err);
        }
    };
    log::debug!("api: {} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => write_response(&mut stream, 204, "text/plain", b""),
        ("GET", "/") => write_json_response(
            &mut stream,
            200,
            &json!({
                "service": "troopwatch",
                "status": "running",
                "target_class": watcher.config().detector.target_class,
            }),
        ),
        ("POST", "/webcam") => webcam_control(&mut stream, watcher, &request),
        ("GET", "/status") => {
            let probe_remote = request.query_flag("probe").unwrap_or(true);
            write_json_response(&mut stream, 200, &watcher.status(probe_remote))
        }
        ("GET", "/detection") => latest_detection(&mut stream, watcher),
        ("GET", "/detections") => {
            let detections = watcher.history().list();
            write_json_response(
                &mut stream,
                200,
                &json!({
                    "total_detections": detections.len(),
                    "detections": detections,
                }),
            )
        }
        ("GET", "/latest-detection-image") => match watcher.history().latest_artifact() {
            Ok((_, bytes)) => write_response(&mut stream, 200, "image/jpeg", &bytes),
            Err(err) if err.kind == ErrorKind::NotFound => write_json_response(
                &mut stream,
                404,
                &json!({"error": "No detections available"}),
            ),
            Err(err) => write_error(&mut stream, &err),
        },
        ("GET", path) if path.starts_with("/detection-image/") => {
            let filename = &path["/detection-image/".len()..];
            match watcher.history().artifact(filename) {
                Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
                Err(err) if err.kind == ErrorKind::NotFound => {
                    write_json_response(&mut stream, 404, &json!({"error": "Image not found"}))
                }
                Err(err) => write_error(&mut stream, &err),
            }
        }
        ("GET", "/video") => match watcher.stream() {
            Ok(frames) => {
                write_stream_header(&mut stream, MJPEG_CONTENT_TYPE)?;
                copy_stream(&mut stream, frames)
            }
            Err(err) if err.kind == ErrorKind::NotActive => write_json_response(
                &mut stream,
                400,
                &json!({
                    "error": "Camera not started. Start it first with POST /webcam and action 'start'",
                }),
            ),
            Err(err) => write_error(&mut stream, &err),
        },
        ("GET", "/pi-video") => match watcher.passthrough() {
            Ok(body) => {
                let content_type = body.content_type().to_string();
                write_stream_header(&mut stream, &content_type)?;
                copy_stream(&mut stream, body)
            }
            Err(err) => write_json_response(
                &mut stream,
                500,
                &json!({"error": format!("Error streaming camera video: {}", err.message)}),
            ),
        },
        ("GET", "/test-pi-connection") => test_connection(&mut stream, watcher),
        (_, path) if ROUTES.contains(&path) || path.starts_with("/detection-image/") => {
            write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))
        }
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

#[derive(Debug, Deserialize)]
struct WebcamCommand {
    action: Option<String>,
    /// Camera URL to use instead of the configured one.
    source: Option<String>,
}

fn webcam_control(stream: &mut TcpStream, watcher: &Watcher, request: &HttpRequest) -> Result<()> {
    let command: WebcamCommand = match serde_json::from_slice(&request.body) {
        Ok(command) => command,
        Err(_) => {
            return write_json_response(stream, 400, &json!({"error": "No JSON data provided"}))
        }
    };

    match command.action.as_deref() {
        Some("start") => match watcher.start(command.source.as_deref()) {
            Ok(StartOutcome::Started { source }) => write_json_response(
                stream,
                200,
                &json!({
                    "status": "webcam started",
                    "message": format!("Camera initialized successfully using {}", source),
                    "source": source,
                }),
            ),
            Ok(StartOutcome::AlreadyRunning { source }) => write_json_response(
                stream,
                200,
                &json!({"status": "webcam already running", "source": source}),
            ),
            Err(err) => {
                let status = if err.kind == ErrorKind::Config { 400 } else { 500 };
                write_json_response(
                    stream,
                    status,
                    &json!({
                        "error": format!("Failed to start camera: {}", err.message),
                        "kind": err.kind.code(),
                    }),
                )
            }
        },
        Some("stop") => match watcher.stop() {
            Ok(StopOutcome::Stopped) => {
                write_json_response(stream, 200, &json!({"status": "webcam stopped"}))
            }
            Ok(StopOutcome::AlreadyStopped) => {
                write_json_response(stream, 200, &json!({"status": "webcam already stopped"}))
            }
            Err(err) => write_error(stream, &err),
        },
        _ => write_json_response(
            stream,
            400,
            &json!({"error": "Invalid action. Use 'start' or 'stop'"}),
        ),
    }
}

fn latest_detection(stream: &mut TcpStream, watcher: &Watcher) -> Result<()> {
    match watcher.latest_detection() {
        Some(latest) => write_json_response::<LatestDetection>(stream, 200, &latest),
        None => write_json_response(
            stream,
            200,
            &json!({
                "detected": false,
                "confidence": 0.0,
                "timestamp": null,
                "class_label": watcher.config().detector.target_class,
                "image_path": null,
            }),
        ),
    }
}

fn test_connection(stream: &mut TcpStream, watcher: &Watcher) -> Result<()> {
    let camera_url = watcher.config().camera.url.clone();
    match watcher.test_connection() {
        Ok(report) => write_json_response(
            stream,
            200,
            &json!({
                "status": "success",
                "camera_url": report.camera_url,
                "http_status": report.http_status,
                "content_type": report.content_type,
                "decoder_connection": if report.strategy.is_some() { "success" } else { "failed" },
                "strategy": report.strategy,
                "attempts": report.attempts,
                "message": report.message,
            }),
        ),
        Err(err) if err.kind == ErrorKind::Unreachable => write_json_response(
            stream,
            400,
            &json!({
                "status": "failed",
                "camera_url": camera_url,
                "error": err.message,
                "details": "camera service is not running or the address is wrong",
            }),
        ),
        Err(err) => write_json_response(
            stream,
            500,
            &json!({
                "status": "failed",
                "camera_url": camera_url,
                "error": err.message,
                "details": "Unexpected error occurred",
            }),
        ),
    }
}

fn error_status(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotActive | ErrorKind::Config => 400,
        ErrorKind::NotFound => 404,
        _ => 500,
    }
}

fn write_error(stream: &mut TcpStream, err: &WatchError) -> Result<()> {
    write_json_response(
        stream,
        error_status(err.kind),
        &json!({"error": err.message, "kind": err.kind.code()}),
    )
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (raw_path.to_string(), None),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        body,
    })
}

fn write_json_response<T: Serialize + ?Sized>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\
         Access-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

/// Header for an open-ended body: no length, the connection ends the response.
fn write_stream_header(stream: &mut TcpStream, content_type: &str) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\nExpires: 0\r\n\
         Access-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        status_line = status_line(200),
        content_type = content_type,
    );
    stream.write_all(header.as_bytes())?;
    Ok(())
}

fn copy_stream<C, I>(stream: &mut TcpStream, chunks: I) -> Result<()>
where
    C: AsRef<[u8]>,
    I: IntoIterator<Item = C>,
{
    let mut sent = 0u64;
    for chunk in chunks {
        if let Err(err) = stream.write_all(chunk.as_ref()) {
            log::debug!("api: viewer left after {} chunks: {}", sent, err);
            return Ok(());
        }
        sent += 1;
    }
    log::debug!("api: stream ended after {} chunks", sent);
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Option<String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// `?name=0|1|true|false`; anything else counts as absent.
    fn query_flag(&self, name: &str) -> Option<bool> {
        let query = self.query.as_deref()?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k != name {
                return None;
            }
            match v {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            }
        })
    }
}
