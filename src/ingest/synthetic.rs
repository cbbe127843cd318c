//! Synthetic feed for `stub://` sources.
//!
//! `stub://name` yields an endless moving gradient paced at the target frame
//! rate. `stub://name?frames=N` ends the stream after N frames, surfacing as
//! `ErrorKind::StreamClosed` like a dropped camera.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::ReadOutcome;
use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

pub(crate) struct SyntheticFeed {
    uri: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    frame_limit: Option<u64>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected: bool,
}

impl SyntheticFeed {
    pub(crate) fn new(uri: &str, width: u32, height: u32, target_fps: u32) -> Self {
        let frame_interval = if target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / target_fps as u64)
        };
        Self {
            uri: uri.to_string(),
            width,
            height,
            frame_interval,
            frame_limit: frame_limit(uri),
            frame_count: 0,
            last_frame_at: None,
            connected: false,
        }
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticFeed: connected to {} (synthetic)", self.uri);
        Ok(())
    }

    pub(crate) fn read_frame(&mut self) -> Result<ReadOutcome> {
        if !self.connected {
            return Err(WatchError::new(ErrorKind::StreamClosed, "synthetic feed not connected").into());
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Err(WatchError::new(
                    ErrorKind::StreamClosed,
                    format!("{} ended after {} frames", self.uri, limit),
                )
                .into());
            }
        }
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                std::thread::sleep(self.frame_interval - elapsed);
            }
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let frame = Frame::from_bgr(self.generate_pixels(), self.width, self.height)?;
        Ok(ReadOutcome::Frame(frame))
    }

    pub(crate) fn release(&mut self) {
        self.connected = false;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (width, height) = (self.width as u64, self.height as u64);
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let shift = x + self.frame_count;
                pixels.push((shift % 256) as u8);
                pixels.push(((y * 255) / height.max(1)) as u8);
                pixels.push(((shift / 2 + y) % 256) as u8);
            }
        }
        pixels
    }
}

fn frame_limit(uri: &str) -> Option<u64> {
    let parsed = url::Url::parse(uri).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "frames")
        .and_then(|(_, value)| value.parse().ok())
}
