//! Boundary-aware `multipart/x-mixed-replace` demuxer.
//!
//! This is the built-in decoding backend (`DecodeBackend::Auto`). Unlike the raw
//! parser it trusts the stream's framing: the boundary comes from the response
//! `Content-Type`, part bodies are sized by `Content-Length` when present and
//! otherwise run up to the next delimiter line.

use anyhow::{Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use super::{http_agent, open_stream, ReadOutcome};
use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

const CHUNK_SIZE: usize = 4096;
const MAX_PART_BYTES: usize = 5 * 1024 * 1024;
const MAX_HEADER_BYTES: usize = 8 * 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";

/// One part of a multipart body.
#[derive(Debug)]
pub struct Part {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub struct MultipartReader<R: Read> {
    reader: R,
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl<R: Read> MultipartReader<R> {
    /// `boundary` is the bare token from the `Content-Type` parameter.
    pub fn new(reader: R, boundary: &str) -> Self {
        Self {
            reader,
            delimiter: format!("--{}", boundary).into_bytes(),
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn read_part(&mut self) -> Result<Part> {
        let delimiter_at = self.fill_until(|buf, delim| find(buf, delim, 0))?;
        // Anything before the delimiter is preamble or trailing CRLF of the last part.
        self.buffer.drain(..delimiter_at);

        let header_end = self.fill_until(|buf, _| {
            find(buf, HEADER_END, 0).map(|pos| pos + HEADER_END.len())
        })?;
        if header_end > MAX_HEADER_BYTES {
            self.buffer.clear();
            return Err(WatchError::new(ErrorKind::DecodeFailure, "multipart header too large").into());
        }
        let header = String::from_utf8_lossy(&self.buffer[self.delimiter.len()..header_end]).into_owned();
        let (content_type, content_length) = parse_part_header(&header);

        let body_end = match content_length {
            Some(len) if len > MAX_PART_BYTES => {
                self.buffer.clear();
                return Err(WatchError::new(
                    ErrorKind::DecodeFailure,
                    format!("multipart part of {} bytes exceeds limit", len),
                )
                .into());
            }
            Some(len) => {
                while self.buffer.len() < header_end + len {
                    self.fill()?;
                }
                header_end + len
            }
            None => {
                let mut next = b"\r\n".to_vec();
                next.extend_from_slice(&self.delimiter);
                self.fill_until(|buf, _| find(buf, &next, header_end))?
            }
        };

        let body = self.buffer[header_end..body_end].to_vec();
        self.buffer.drain(..body_end);
        Ok(Part { content_type, body })
    }

    fn fill_until<F>(&mut self, mut locate: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> Option<usize>,
    {
        loop {
            if let Some(pos) = locate(&self.buffer, &self.delimiter) {
                return Ok(pos);
            }
            if self.buffer.len() > MAX_PART_BYTES {
                self.buffer.clear();
                return Err(WatchError::new(
                    ErrorKind::DecodeFailure,
                    "multipart stream lost framing",
                )
                .into());
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let read = self.reader.read(&mut chunk).map_err(|e| {
            WatchError::new(ErrorKind::StreamClosed, format!("read multipart chunk: {}", e))
        })?;
        if read == 0 {
            return Err(WatchError::new(ErrorKind::StreamClosed, "multipart stream ended").into());
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(())
    }
}

/// Extract the boundary token from a `multipart/*; boundary=...` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim().to_ascii_lowercase();
    if !mime.starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        // Some cameras repeat the leading dashes in the parameter.
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn parse_part_header(header: &str) -> (Option<String>, Option<usize>) {
    let mut content_type = None;
    let mut content_length = None;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        } else if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        }
    }
    (content_type, content_length)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// HTTP multipart capture used by `DecodeBackend::Auto`.
pub struct MultipartCapture {
    url: String,
    width: u32,
    height: u32,
    connect_timeout: Duration,
    read_timeout: Duration,
    reader: Option<MultipartReader<Box<dyn Read + Send + Sync>>>,
    connected_at: Option<Instant>,
}

impl MultipartCapture {
    pub fn new(
        url: &str,
        width: u32,
        height: u32,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            url: url.to_string(),
            width,
            height,
            connect_timeout,
            read_timeout,
            reader: None,
            connected_at: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let agent = http_agent(self.connect_timeout, self.read_timeout);
        let (content_type, body) =
            open_stream(&agent, &self.url).context("connect multipart stream")?;
        let boundary = boundary_from_content_type(&content_type).ok_or_else(|| {
            WatchError::new(
                ErrorKind::DecodeFailure,
                format!("{} is not a multipart stream (content-type: {:?})", self.url, content_type),
            )
        })?;
        log::info!(
            "MultipartCapture: connected to {} (boundary: {})",
            self.url,
            boundary
        );
        self.reader = Some(MultipartReader::new(body, &boundary));
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            WatchError::new(ErrorKind::StreamClosed, "multipart stream not connected")
        })?;
        let part = reader.read_part()?;
        let is_jpeg = part
            .content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().starts_with("image/jpeg"))
            .unwrap_or(true);
        if !is_jpeg || part.body.is_empty() {
            log::debug!(
                "MultipartCapture: skipping part ({:?}, {} bytes)",
                part.content_type,
                part.body.len()
            );
            return Ok(ReadOutcome::NoFrame);
        }
        let frame = Frame::decode_jpeg(&part.body)?;
        if frame.width == self.width && frame.height == self.height {
            return Ok(ReadOutcome::Frame(frame));
        }
        Ok(ReadOutcome::Frame(frame.resized(self.width, self.height)?))
    }

    pub fn release(&mut self) {
        if self.reader.take().is_some() {
            log::info!("MultipartCapture: released {}", self.url);
        }
        self.connected_at = None;
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn boundary_parsing_handles_common_variants() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--myboundary\"")
                .as_deref(),
            Some("myboundary")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
        assert_eq!(boundary_from_content_type("multipart/x-mixed-replace"), None);
    }

    #[test]
    fn reads_parts_with_and_without_content_length() -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n");
        body.extend_from_slice(b"\xFF\r\n\xD9");
        body.extend_from_slice(b"\r\n--frame\r\nContent-Type: text/plain\r\n\r\nhello");
        body.extend_from_slice(b"\r\n--frame\r\n");

        let mut reader = MultipartReader::new(Cursor::new(body), "frame");
        let first = reader.read_part()?;
        assert_eq!(first.body, b"\xFF\r\n\xD9");
        assert_eq!(first.content_type.as_deref(), Some("image/jpeg"));

        let second = reader.read_part()?;
        assert_eq!(second.body, b"hello");
        assert_eq!(second.content_type.as_deref(), Some("text/plain"));

        let err = reader.read_part().unwrap_err();
        assert_eq!(crate::kind_of(&err), Some(ErrorKind::StreamClosed));
        Ok(())
    }

    #[test]
    fn connects_with_boundary_from_response_header() -> Result<()> {
        use std::io::Write;
        use std::net::TcpListener;

        let jpeg = Frame::from_bgr(vec![90u8; 16 * 12 * 3], 16, 12)?.encode_jpeg(90)?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}/video", listener.local_addr()?);
        let camera = std::thread::spawn(move || -> std::io::Result<()> {
            let (mut stream, _) = listener.accept()?;
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request)?;
            stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n",
            )?;
            stream.write_all(
                format!("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", jpeg.len())
                    .as_bytes(),
            )?;
            stream.write_all(&jpeg)?;
            stream.write_all(b"\r\n--frame\r\n")?;
            Ok(())
        });

        let mut capture = MultipartCapture::new(&url, 16, 12, Duration::from_secs(2), Duration::from_secs(2));
        capture.connect()?;
        match capture.read_frame()? {
            ReadOutcome::Frame(frame) => assert_eq!((frame.width, frame.height), (16, 12)),
            ReadOutcome::NoFrame => panic!("expected a frame"),
        }
        capture.release();
        camera.join().expect("camera thread")?;
        Ok(())
    }
}
