//! Decoded video frames.
//!
//! Frames travel through the pipeline in BGR channel order. Everything that
//! decodes from the wire (JPEG, RGB capture buffers) swaps red and blue once at
//! the ingest edge, and everything that encodes back out swaps them again.

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use std::time::Instant;

use crate::{ErrorKind, WatchError};

/// A decoded frame in BGR24 order.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// Wrap a BGR24 buffer, validating its length.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = packed_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "BGR frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Take an RGB buffer and swap it into BGR order.
    pub fn from_rgb(mut data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        swap_red_blue(&mut data);
        Self::from_bgr(data, width, height)
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let mut data = image.into_raw();
        swap_red_blue(&mut data);
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    /// Decode a JPEG. Failures carry `ErrorKind::DecodeFailure`.
    pub fn decode_jpeg(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg).map_err(|e| {
            WatchError::new(ErrorKind::DecodeFailure, format!("decode jpeg: {}", e))
        })?;
        let frame = Self::from_rgb_image(image.into_rgb8());
        if frame.is_empty() {
            return Err(WatchError::new(ErrorKind::DecodeFailure, "decoded jpeg is empty").into());
        }
        Ok(frame)
    }

    pub fn as_bgr(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// Copy out an RGB image (for encoding or RGB-only consumers).
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let mut data = self.data.clone();
        swap_red_blue(&mut data);
        RgbImage::from_raw(self.width, self.height, data)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Borrow the buffer as a 3-channel image without reordering channels.
    pub(crate) fn as_bgr_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    pub(crate) fn from_bgr_image(image: RgbImage, captured_at: Instant) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            captured_at,
        }
    }

    /// Resize to `width`x`height`. A no-op copy when already at that size.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize to {}x{}", width, height));
        }
        if self.is_empty() {
            return Err(anyhow!("cannot resize an empty frame"));
        }
        if self.width == width && self.height == height {
            return Ok(self.clone());
        }
        let image = self.as_bgr_image()?;
        let resized = image::imageops::resize(&image, width, height, FilterType::Triangle);
        Ok(Self::from_bgr_image(resized, self.captured_at))
    }

    /// Encode as a baseline JPEG at `quality` (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let image = self.to_rgb_image()?;
        let mut out = Vec::with_capacity(self.data.len() / 8);
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode_image(&image)
            .context("encode jpeg")?;
        Ok(out)
    }
}

/// Swap the first and third byte of every 3-byte pixel in place.
pub fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

fn packed_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
