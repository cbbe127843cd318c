//! Frame sources.
//!
//! Every way of getting frames into the pipeline is one variant of `FrameSource`:
//! - `BackendCapture`: a decoding backend opened against the camera URL
//!   (ffmpeg, gstreamer, or the built-in multipart demuxer)
//! - `RawStreamParser`: byte-level MJPEG extraction over a plain HTTP body
//! - `LocalDeviceCapture`: a local camera (V4L2 device node)
//!
//! All variants share the same capability set: `connect`, `read_frame`, `release`.
//! Reads are bounded by socket or pipeline timeouts; none of them block forever.

pub mod backend;
pub mod local;
pub mod mjpeg;
pub mod multipart;
mod synthetic;

use anyhow::{Context, Result};
use std::io::Read;
use std::time::Duration;

use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

pub use backend::{BackendCapture, CaptureSettings, DecodeBackend};
pub use local::LocalDeviceCapture;
pub use mjpeg::{MjpegReader, RawStreamParser};

/// Result of one `read_frame` call that did not fail outright.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// Nothing usable this time; the caller retries.
    NoFrame,
}

/// Tagged union over every frame source the orchestrator can hand out.
pub enum FrameSource {
    Backend(BackendCapture),
    RawStream(RawStreamParser),
    LocalDevice(LocalDeviceCapture),
}

impl FrameSource {
    pub fn connect(&mut self) -> Result<()> {
        match self {
            FrameSource::Backend(source) => source.connect(),
            FrameSource::RawStream(source) => source.connect(),
            FrameSource::LocalDevice(source) => source.connect(),
        }
    }

    /// Read the next frame.
    ///
    /// Errors carrying `ErrorKind::StreamClosed` mean the source is gone;
    /// `ErrorKind::DecodeFailure` is a single bad frame.
    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        match self {
            FrameSource::Backend(source) => source.read_frame(),
            FrameSource::RawStream(source) => source.read_frame(),
            FrameSource::LocalDevice(source) => source.read_frame(),
        }
    }

    /// Release the underlying handle. Safe to call more than once.
    pub fn release(&mut self) {
        match self {
            FrameSource::Backend(source) => source.release(),
            FrameSource::RawStream(source) => source.release(),
            FrameSource::LocalDevice(source) => source.release(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            FrameSource::Backend(source) => source.is_connected(),
            FrameSource::RawStream(source) => source.is_connected(),
            FrameSource::LocalDevice(source) => source.is_connected(),
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            FrameSource::Backend(source) => source.uri(),
            FrameSource::RawStream(source) => source.uri(),
            FrameSource::LocalDevice(source) => source.uri(),
        }
    }

    pub fn frames_read(&self) -> u64 {
        match self {
            FrameSource::Backend(source) => source.frames_read(),
            FrameSource::RawStream(source) => source.frames_read(),
            FrameSource::LocalDevice(source) => source.frames_read(),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// HTTP agent with bounded connect and per-read timeouts.
pub(crate) fn http_agent(connect_timeout: Duration, read_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(connect_timeout)
        .timeout_read(read_timeout)
        .timeout_write(read_timeout)
        .build()
}

/// Status code and content type of a GET, with the body left unread.
pub(crate) struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub response: Option<ureq::Response>,
}

/// Issue a GET and return the status even for 4xx/5xx responses.
pub(crate) fn http_get(agent: &ureq::Agent, url: &str) -> Result<HttpResponse> {
    match agent.get(url).call() {
        Ok(response) => Ok(HttpResponse {
            status: response.status(),
            content_type: raw_content_type(&response),
            response: Some(response),
        }),
        Err(ureq::Error::Status(status, response)) => Ok(HttpResponse {
            status,
            content_type: raw_content_type(&response),
            response: None,
        }),
        Err(err) => Err(anyhow::Error::new(err)).with_context(|| format!("GET {}", url)),
    }
}

/// Full `Content-Type` header, parameters included (`boundary=...`).
fn raw_content_type(response: &ureq::Response) -> String {
    response
        .header("Content-Type")
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Open a streaming GET, failing with `Unreachable` on non-200.
pub(crate) fn open_stream(
    agent: &ureq::Agent,
    url: &str,
) -> Result<(String, Box<dyn Read + Send + Sync>)> {
    let reply = http_get(agent, url)
        .map_err(|e| WatchError::new(ErrorKind::Unreachable, format!("{:#}", e)))?;
    match reply.response {
        Some(response) if reply.status == 200 => Ok((reply.content_type, response.into_reader())),
        _ => Err(WatchError::new(
            ErrorKind::Unreachable,
            format!("GET {} returned HTTP {}", url, reply.status),
        )
        .into()),
    }
}

pub(crate) fn is_stub_uri(uri: &str) -> bool {
    uri.starts_with("stub://")
}
