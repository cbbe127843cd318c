//! Multipart JPEG fan-out to HTTP viewers.
//!
//! The frame loop publishes each annotated frame into a single slot; every
//! viewer holds an `MjpegStream` iterator that waits on the slot and yields the
//! newest chunk it has not sent yet. Slow viewers skip frames instead of
//! queueing them.

use anyhow::Result;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::StreamSettings;
use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap one JPEG in its multipart delimiter and part header.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(jpeg.len() + 64);
    chunk.extend_from_slice(b"--");
    chunk.extend_from_slice(BOUNDARY.as_bytes());
    chunk.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[derive(Default)]
struct FrameSlot {
    seq: u64,
    chunk: Option<Arc<[u8]>>,
}

pub struct StreamPublisher {
    active: AtomicBool,
    slot: Mutex<FrameSlot>,
    ready: Condvar,
    jpeg_quality: u8,
    idle_poll: Duration,
    viewers: AtomicUsize,
}

impl StreamPublisher {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            active: AtomicBool::new(false),
            slot: Mutex::new(FrameSlot::default()),
            ready: Condvar::new(),
            jpeg_quality: settings.jpeg_quality,
            idle_poll: settings.idle_poll,
            viewers: AtomicUsize::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Flip the lifecycle flag. Going inactive wakes every viewer so it can finish.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        if !active {
            let mut slot = self.lock_slot();
            slot.chunk = None;
            drop(slot);
            self.ready.notify_all();
        }
    }

    /// Encode `frame` and hand it to every viewer.
    pub fn publish(&self, frame: &Frame) -> Result<()> {
        let jpeg = frame.encode_jpeg(self.jpeg_quality)?;
        let chunk: Arc<[u8]> = Arc::from(multipart_chunk(&jpeg));
        let mut slot = self.lock_slot();
        slot.seq += 1;
        slot.chunk = Some(chunk);
        drop(slot);
        self.ready.notify_all();
        Ok(())
    }

    /// Attach a viewer. Fails with `NotActive` when no stream is running.
    pub fn subscribe(self: &Arc<Self>) -> Result<MjpegStream, WatchError> {
        if !self.is_active() {
            return Err(WatchError::new(
                ErrorKind::NotActive,
                "webcam not active; start it first",
            ));
        }
        self.viewers.fetch_add(1, Ordering::SeqCst);
        let last_seq = self.lock_slot().seq;
        Ok(MjpegStream {
            publisher: Arc::clone(self),
            last_seq,
        })
    }

    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    fn lock_slot(&self) -> MutexGuard<'_, FrameSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One viewer's view of the stream. Ends when the publisher goes inactive.
pub struct MjpegStream {
    publisher: Arc<StreamPublisher>,
    last_seq: u64,
}

impl Iterator for MjpegStream {
    type Item = Arc<[u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let publisher = &self.publisher;
        let mut slot = publisher.lock_slot();
        loop {
            if !publisher.is_active() {
                return None;
            }
            if slot.seq > self.last_seq {
                if let Some(chunk) = &slot.chunk {
                    self.last_seq = slot.seq;
                    return Some(Arc::clone(chunk));
                }
            }
            // Nothing new: idle and re-check the active flag.
            slot = match publisher.ready.wait_timeout(slot, publisher.idle_poll) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        self.publisher.viewers.fetch_sub(1, Ordering::SeqCst);
    }
}

const PASSTHROUGH_CHUNK: usize = 1024;

/// Camera body proxied as-is, 1 KiB at a time. Ends at EOF or the first read error.
pub struct PassthroughStream {
    content_type: String,
    body: Box<dyn Read + Send + Sync>,
    done: bool,
}

impl PassthroughStream {
    pub fn new(content_type: String, body: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            content_type,
            body,
            done: false,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

impl Iterator for PassthroughStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = vec![0u8; PASSTHROUGH_CHUNK];
        match self.body.read(&mut chunk) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                chunk.truncate(n);
                Some(chunk)
            }
            Err(err) => {
                log::warn!("passthrough: camera read failed: {}", err);
                self.done = true;
                None
            }
        }
    }
}
