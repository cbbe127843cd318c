//! Raw MJPEG-over-HTTP frame extraction.
//!
//! `RawStreamParser` opens the camera URL as a plain HTTP body and pulls JPEG
//! images out of it by marker scanning, without a multipart-aware decoder.
//! It is the fallback for cameras whose part headers confuse the decoding
//! backends, so it deliberately does not validate boundaries.
//!
//! Extraction, per frame:
//! 1. Accumulate 1 KiB reads until the buffer holds an empty line (`CRLFCRLF`).
//! 2. Look for a start-of-image marker (`FF D8`) after that point; if there is
//!    none, report no frame and let the caller retry.
//! 3. Keep reading until an end-of-image marker (`FF D9`) follows, then slice
//!    start..end+2 out as one JPEG.
//!
//! A read returning zero bytes is connection loss (`ErrorKind::StreamClosed`).

use anyhow::{Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use super::{http_agent, open_stream, ReadOutcome};
use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

const CHUNK_SIZE: usize = 1024;
const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const MAX_PREAMBLE_BYTES: usize = 64 * 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";
const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Marker-scanning JPEG extractor over any byte reader.
pub struct MjpegReader<R: Read> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Extract the next complete JPEG. `Ok(None)` means no start marker
    /// followed the part header; bytes after it stay buffered for the next call.
    pub fn read_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scan_from = 0;
        let header_end = loop {
            if let Some(pos) = find(&self.buffer, HEADER_END, scan_from) {
                break pos + HEADER_END.len();
            }
            // Resume just before the tail so a marker split across reads is still found.
            scan_from = self.buffer.len().saturating_sub(HEADER_END.len() - 1);
            if self.buffer.len() > MAX_PREAMBLE_BYTES {
                self.buffer.drain(..scan_from);
                scan_from = 0;
            }
            self.fill()?;
        };
        while self.buffer.len() < header_end + SOI.len() {
            self.fill()?;
        }

        let Some(start) = find(&self.buffer, &SOI, header_end) else {
            self.buffer.drain(..header_end);
            return Ok(None);
        };

        let mut scan_from = start + SOI.len();
        let end = loop {
            if let Some(pos) = find(&self.buffer, &EOI, scan_from) {
                break pos + EOI.len();
            }
            scan_from = self.buffer.len().saturating_sub(1).max(start + SOI.len());
            if self.buffer.len() - start > MAX_JPEG_BYTES {
                self.buffer.clear();
                return Err(WatchError::new(
                    ErrorKind::DecodeFailure,
                    "mjpeg frame exceeded max jpeg size",
                )
                .into());
            }
            self.fill()?;
        };

        let jpeg = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(jpeg))
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let read = self.reader.read(&mut chunk).map_err(|e| {
            WatchError::new(ErrorKind::StreamClosed, format!("read mjpeg chunk: {}", e))
        })?;
        if read == 0 {
            return Err(WatchError::new(ErrorKind::StreamClosed, "mjpeg stream ended").into());
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(())
    }
}

/// `FrameSource` variant reading raw MJPEG over HTTP.
pub struct RawStreamParser {
    url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<MjpegReader<Box<dyn Read + Send + Sync>>>,
    connected_at: Option<Instant>,
    frame_count: u64,
}

impl RawStreamParser {
    pub fn new(url: &str, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout,
            read_timeout,
            stream: None,
            connected_at: None,
            frame_count: 0,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let agent = http_agent(self.connect_timeout, self.read_timeout);
        let (content_type, reader) =
            open_stream(&agent, &self.url).context("connect raw mjpeg stream")?;
        log::info!(
            "RawStreamParser: connected to {} (content-type: {})",
            self.url,
            if content_type.is_empty() {
                "unknown"
            } else {
                &content_type
            }
        );
        self.stream = Some(MjpegReader::new(reader));
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            WatchError::new(ErrorKind::StreamClosed, "raw mjpeg stream not connected")
        })?;
        let Some(jpeg) = stream.read_jpeg()? else {
            return Ok(ReadOutcome::NoFrame);
        };
        let frame = Frame::decode_jpeg(&jpeg)?;
        self.frame_count += 1;
        Ok(ReadOutcome::Frame(frame))
    }

    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            log::info!("RawStreamParser: released {}", self.url);
        }
        self.connected_at = None;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn uri(&self) -> &str {
        &self.url
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::io::Cursor;

    fn sample_jpeg() -> Vec<u8> {
        let image = RgbImage::from_fn(24, 16, |x, y| image::Rgb([(x * 10) as u8, 90, (y * 15) as u8]));
        Frame::from_rgb_image(image).encode_jpeg(90).unwrap()
    }

    fn part(jpeg: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        out.extend_from_slice(jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let len = buf.len().min(self.step);
            self.data.read(&mut buf[..len])
        }
    }

    #[test]
    fn extracts_exact_jpeg_bytes() -> Result<()> {
        let jpeg = sample_jpeg();
        let mut reader = MjpegReader::new(Cursor::new(part(&jpeg)));
        let extracted = reader.read_jpeg()?.expect("frame");
        assert_eq!(extracted, jpeg);
        Ok(())
    }

    #[test]
    fn extracted_frame_decodes_to_source_pixels() -> Result<()> {
        let source = RgbImage::from_pixel(16, 16, image::Rgb([220, 40, 10]));
        let jpeg = Frame::from_rgb_image(source).encode_jpeg(95)?;
        let mut reader = MjpegReader::new(Cursor::new(part(&jpeg)));
        let frame = Frame::decode_jpeg(&reader.read_jpeg()?.expect("frame"))?;

        // BGR order downstream: blue first, red last.
        for px in frame.as_bgr().chunks_exact(3) {
            assert!(px[0].abs_diff(10) <= 6, "blue {:?}", px);
            assert!(px[1].abs_diff(40) <= 6, "green {:?}", px);
            assert!(px[2].abs_diff(220) <= 6, "red {:?}", px);
        }
        Ok(())
    }

    #[test]
    fn markers_split_across_reads_are_found() -> Result<()> {
        let jpeg = sample_jpeg();
        let mut stream = part(&jpeg);
        stream.extend_from_slice(&part(&jpeg));
        let mut reader = MjpegReader::new(Trickle {
            data: Cursor::new(stream),
            step: 7,
        });
        assert_eq!(reader.read_jpeg()?.expect("first"), jpeg);
        assert_eq!(reader.read_jpeg()?.expect("second"), jpeg);
        Ok(())
    }

    #[test]
    fn tolerates_nonconforming_boundaries() -> Result<()> {
        let jpeg = sample_jpeg();
        let mut stream = b"garbage preamble\r\nX-Whatever: 1\r\n\r\n".to_vec();
        stream.extend_from_slice(b"\x00\x01noise");
        stream.extend_from_slice(&jpeg);
        let mut reader = MjpegReader::new(Cursor::new(stream));
        assert_eq!(reader.read_jpeg()?.expect("frame"), jpeg);
        Ok(())
    }

    #[test]
    fn header_without_image_is_no_frame() -> Result<()> {
        let mut reader = MjpegReader::new(Cursor::new(b"--frame\r\n\r\nno image here".to_vec()));
        assert!(reader.read_jpeg()?.is_none());
        Ok(())
    }

    #[test]
    fn eof_is_stream_closed() {
        let jpeg = sample_jpeg();
        let truncated = part(&jpeg[..jpeg.len() / 2]);
        let mut reader = MjpegReader::new(Cursor::new(truncated));
        let err = reader.read_jpeg().unwrap_err();
        assert_eq!(crate::kind_of(&err), Some(ErrorKind::StreamClosed));

        let mut empty = MjpegReader::new(Cursor::new(Vec::new()));
        let err = empty.read_jpeg().unwrap_err();
        assert_eq!(crate::kind_of(&err), Some(ErrorKind::StreamClosed));
    }

    #[test]
    fn long_preamble_is_skipped() -> Result<()> {
        let jpeg = sample_jpeg();
        let mut stream = vec![b'x'; 10 * 1024 * 1024];
        stream.extend_from_slice(&part(&jpeg));
        let mut reader = MjpegReader::new(Cursor::new(stream));
        assert_eq!(reader.read_jpeg()?.expect("frame"), jpeg);
        assert!(reader.buffer.len() < 64 * 1024);
        Ok(())
    }

    #[test]
    fn oversized_frame_is_decode_failure() -> Result<()> {
        let mut stream = b"--frame\r\n\r\n\xFF\xD8".to_vec();
        stream.extend_from_slice(&vec![0u8; MAX_JPEG_BYTES + 64 * 1024]);
        stream.extend_from_slice(&part(&sample_jpeg()));
        let mut reader = MjpegReader::new(Cursor::new(stream));

        let err = reader.read_jpeg().unwrap_err();
        assert_eq!(crate::kind_of(&err), Some(ErrorKind::DecodeFailure));
        assert!(reader.buffer.is_empty());
        Ok(())
    }
}
