//! Local camera capture, the last resort of the acquisition cascade.
//!
//! Real devices go through V4L2 (`local-v4l2` feature) with a single capture
//! buffer so reads always return the newest frame. `stub://` device names
//! produce a synthetic feed.

use anyhow::Result;

use super::synthetic::SyntheticFeed;
use super::{is_stub_uri, ReadOutcome};
use crate::{ErrorKind, WatchError};

#[cfg(feature = "local-v4l2")]
use ouroboros::self_referencing;

pub struct LocalDeviceCapture {
    device: String,
    target_fps: u32,
    width: u32,
    height: u32,
    backend: LocalBackend,
    frame_count: u64,
}

enum LocalBackend {
    Idle,
    Synthetic(SyntheticFeed),
    #[cfg(feature = "local-v4l2")]
    Device(V4l2Capture),
}

impl LocalDeviceCapture {
    pub fn new(device: &str, width: u32, height: u32, target_fps: u32) -> Self {
        Self {
            device: device.to_string(),
            target_fps,
            width,
            height,
            backend: LocalBackend::Idle,
            frame_count: 0,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.release();
        if is_stub_uri(&self.device) {
            let mut feed =
                SyntheticFeed::new(&self.device, self.width, self.height, self.target_fps);
            feed.connect()?;
            self.backend = LocalBackend::Synthetic(feed);
            return Ok(());
        }
        self.connect_device()
    }

    #[cfg(feature = "local-v4l2")]
    fn connect_device(&mut self) -> Result<()> {
        let capture = V4l2Capture::open(&self.device, self.width, self.height, self.target_fps)
            .map_err(|e| WatchError::from_anyhow(ErrorKind::Unreachable, e))?;
        self.backend = LocalBackend::Device(capture);
        Ok(())
    }

    #[cfg(not(feature = "local-v4l2"))]
    fn connect_device(&mut self) -> Result<()> {
        Err(WatchError::new(
            ErrorKind::Unreachable,
            format!(
                "local device {} requires the local-v4l2 feature",
                self.device
            ),
        )
        .into())
    }

    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        let outcome = match &mut self.backend {
            LocalBackend::Idle => {
                return Err(WatchError::new(
                    ErrorKind::StreamClosed,
                    format!("local device {} not connected", self.device),
                )
                .into())
            }
            LocalBackend::Synthetic(feed) => feed.read_frame()?,
            #[cfg(feature = "local-v4l2")]
            LocalBackend::Device(capture) => capture.read_frame()?,
        };
        if matches!(outcome, ReadOutcome::Frame(_)) {
            self.frame_count += 1;
        }
        Ok(outcome)
    }

    pub fn release(&mut self) {
        if !matches!(self.backend, LocalBackend::Idle) {
            log::info!("LocalDeviceCapture: released {}", self.device);
        }
        self.backend = LocalBackend::Idle;
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.backend, LocalBackend::Idle)
    }

    pub fn uri(&self) -> &str {
        &self.device
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }
}

// ----------------------------------------------------------------------------
// V4L2 device
// ----------------------------------------------------------------------------

#[cfg(feature = "local-v4l2")]
struct V4l2Capture {
    state: V4l2State,
    width: u32,
    height: u32,
}

#[cfg(feature = "local-v4l2")]
#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "local-v4l2")]
impl V4l2Capture {
    fn open(path: &str, width: u32, height: u32, target_fps: u32) -> Result<Self> {
        use anyhow::Context;
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("LocalDeviceCapture: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            anyhow::bail!("{} does not support RGB3 capture (got {})", path, format.fourcc);
        }

        if target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("LocalDeviceCapture: failed to set fps on {}: {}", path, err);
            }
        }

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 1)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "LocalDeviceCapture: connected to {} ({}x{})",
            path,
            format.width,
            format.height
        );
        Ok(Self {
            state,
            width: format.width,
            height: format.height,
        })
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        use v4l::io::traits::CaptureStream;

        let (width, height) = (self.width, self.height);
        let pixels = self
            .state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| {
                WatchError::new(ErrorKind::StreamClosed, format!("capture v4l2 frame: {}", err))
            })?;
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() < expected {
            return Ok(ReadOutcome::NoFrame);
        }
        let mut pixels = pixels;
        pixels.truncate(expected);
        Ok(ReadOutcome::Frame(crate::frame::Frame::from_rgb(
            pixels, width, height,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_device_produces_frames() -> Result<()> {
        let mut capture = LocalDeviceCapture::new("stub://desk", 64, 48, 0);
        assert!(!capture.is_connected());
        capture.connect()?;
        match capture.read_frame()? {
            ReadOutcome::Frame(frame) => assert_eq!((frame.width, frame.height), (64, 48)),
            ReadOutcome::NoFrame => panic!("expected frame"),
        }
        capture.release();
        assert!(!capture.is_connected());
        Ok(())
    }

    #[cfg(not(feature = "local-v4l2"))]
    #[test]
    fn real_device_needs_feature() {
        let mut capture = LocalDeviceCapture::new("/dev/video0", 64, 48, 15);
        let err = capture.connect().unwrap_err();
        assert_eq!(crate::kind_of(&err), Some(ErrorKind::Unreachable));
    }
}
