//! Decoding backends opened against the camera URL.
//!
//! Each backend is asked for BGR frames at the configured resolution and frame
//! rate with a one-frame buffer, so a slow consumer always sees the newest frame
//! rather than a growing backlog.
//!
//! `ffmpeg` and `gstreamer` are feature-gated (`backend-ffmpeg`,
//! `backend-gstreamer`). When a backend is not compiled in, opening it fails and
//! the acquisition cascade moves on. `auto` is always available and uses the
//! built-in multipart demuxer. Any backend opened against a `stub://` URL
//! produces a synthetic feed.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::multipart::MultipartCapture;
use super::synthetic::SyntheticFeed;
use super::{is_stub_uri, ReadOutcome};
use crate::config::CameraSettings;
use crate::{ErrorKind, WatchError};

#[cfg(feature = "backend-ffmpeg")]
use ffmpeg_next as ffmpeg;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeBackend {
    Ffmpeg,
    Gstreamer,
    Auto,
}

impl DecodeBackend {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(DecodeBackend::Ffmpeg),
            "gstreamer" => Ok(DecodeBackend::Gstreamer),
            "auto" | "any" => Ok(DecodeBackend::Auto),
            other => Err(anyhow!(
                "unknown decode backend '{}'; expected ffmpeg, gstreamer or auto",
                other
            )),
        }
    }

    /// Cascade order tried by acquisition.
    pub fn default_order() -> Vec<Self> {
        vec![
            DecodeBackend::Ffmpeg,
            DecodeBackend::Gstreamer,
            DecodeBackend::Auto,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            DecodeBackend::Ffmpeg => "ffmpeg",
            DecodeBackend::Gstreamer => "gstreamer",
            DecodeBackend::Auto => "auto",
        }
    }

    pub fn is_compiled(self) -> bool {
        match self {
            DecodeBackend::Ffmpeg => cfg!(feature = "backend-ffmpeg"),
            DecodeBackend::Gstreamer => cfg!(feature = "backend-gstreamer"),
            DecodeBackend::Auto => true,
        }
    }
}

impl std::fmt::Display for DecodeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Capture parameters requested from every backend.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub buffer_frames: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl CaptureSettings {
    pub fn from_camera(camera: &CameraSettings) -> Self {
        Self {
            target_fps: camera.target_fps,
            width: camera.width,
            height: camera.height,
            buffer_frames: 1,
            connect_timeout: camera.probe_timeout,
            read_timeout: camera.read_timeout,
        }
    }
}

pub struct BackendCapture {
    backend: DecodeBackend,
    url: String,
    settings: CaptureSettings,
    handle: Option<BackendHandle>,
    frame_count: u64,
}

enum BackendHandle {
    Synthetic(SyntheticFeed),
    Auto(MultipartCapture),
    #[cfg(feature = "backend-ffmpeg")]
    Ffmpeg(FfmpegHttpCapture),
    #[cfg(feature = "backend-gstreamer")]
    Gstreamer(GstreamerHttpCapture),
}

impl BackendCapture {
    /// Prepare a capture. Fails immediately if the backend is not compiled in.
    pub fn open(backend: DecodeBackend, url: &str, settings: CaptureSettings) -> Result<Self> {
        if !is_stub_uri(url) && !backend.is_compiled() {
            return Err(WatchError::new(
                ErrorKind::Unreachable,
                format!(
                    "{} backend is not compiled in (enable the backend-{} feature)",
                    backend, backend
                ),
            )
            .into());
        }
        Ok(Self {
            backend,
            url: url.to_string(),
            settings,
            handle: None,
            frame_count: 0,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        self.release();
        let settings = &self.settings;
        let mut handle = if is_stub_uri(&self.url) {
            BackendHandle::Synthetic(SyntheticFeed::new(
                &self.url,
                settings.width,
                settings.height,
                settings.target_fps,
            ))
        } else {
            match self.backend {
                DecodeBackend::Auto => BackendHandle::Auto(MultipartCapture::new(
                    &self.url,
                    settings.width,
                    settings.height,
                    settings.connect_timeout,
                    settings.read_timeout,
                )),
                #[cfg(feature = "backend-ffmpeg")]
                DecodeBackend::Ffmpeg => {
                    BackendHandle::Ffmpeg(FfmpegHttpCapture::new(&self.url, settings)?)
                }
                #[cfg(feature = "backend-gstreamer")]
                DecodeBackend::Gstreamer => {
                    BackendHandle::Gstreamer(GstreamerHttpCapture::new(&self.url, settings)?)
                }
                #[allow(unreachable_patterns)]
                other => {
                    return Err(WatchError::new(
                        ErrorKind::Unreachable,
                        format!("{} backend is not compiled in", other),
                    )
                    .into())
                }
            }
        };
        match &mut handle {
            BackendHandle::Synthetic(feed) => feed.connect()?,
            BackendHandle::Auto(capture) => capture.connect()?,
            #[cfg(feature = "backend-ffmpeg")]
            BackendHandle::Ffmpeg(_) => {}
            #[cfg(feature = "backend-gstreamer")]
            BackendHandle::Gstreamer(capture) => capture.connect()?,
        }
        log::info!("BackendCapture: opened {} with {}", self.url, self.backend);
        self.handle = Some(handle);
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        let handle = self.handle.as_mut().ok_or_else(|| {
            WatchError::new(
                ErrorKind::StreamClosed,
                format!("{} capture not connected", self.backend),
            )
        })?;
        let outcome = match handle {
            BackendHandle::Synthetic(feed) => feed.read_frame()?,
            BackendHandle::Auto(capture) => capture.read_frame()?,
            #[cfg(feature = "backend-ffmpeg")]
            BackendHandle::Ffmpeg(capture) => capture.read_frame()?,
            #[cfg(feature = "backend-gstreamer")]
            BackendHandle::Gstreamer(capture) => capture.read_frame()?,
        };
        if matches!(outcome, ReadOutcome::Frame(_)) {
            self.frame_count += 1;
        }
        Ok(outcome)
    }

    pub fn release(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match &mut handle {
            BackendHandle::Synthetic(feed) => feed.release(),
            BackendHandle::Auto(capture) => capture.release(),
            #[cfg(feature = "backend-ffmpeg")]
            BackendHandle::Ffmpeg(_) => {}
            #[cfg(feature = "backend-gstreamer")]
            BackendHandle::Gstreamer(capture) => capture.release(),
        }
        log::debug!("BackendCapture: released {} ({})", self.url, self.backend);
    }

    pub fn is_connected(&self) -> bool {
        match &self.handle {
            None => false,
            Some(BackendHandle::Synthetic(feed)) => feed.is_connected(),
            Some(BackendHandle::Auto(capture)) => capture.is_connected(),
            #[cfg(feature = "backend-ffmpeg")]
            Some(BackendHandle::Ffmpeg(_)) => true,
            #[cfg(feature = "backend-gstreamer")]
            Some(BackendHandle::Gstreamer(_)) => true,
        }
    }

    pub fn uri(&self) -> &str {
        &self.url
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }
}

// ----------------------------------------------------------------------------
// ffmpeg over HTTP
// ----------------------------------------------------------------------------

#[cfg(feature = "backend-ffmpeg")]
struct FfmpegHttpCapture {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

#[cfg(feature = "backend-ffmpeg")]
impl FfmpegHttpCapture {
    fn new(url: &str, settings: &CaptureSettings) -> Result<Self> {
        use anyhow::Context;

        ffmpeg::init().context("initialize ffmpeg")?;
        let mut options = ffmpeg::Dictionary::new();
        // Microseconds, applied to connect and every read.
        let timeout_us = settings.read_timeout.as_micros().to_string();
        options.set("rw_timeout", &timeout_us);
        options.set("framerate", &settings.target_fps.to_string());
        options.set("fflags", "nobuffer");

        let input = ffmpeg::format::input_with_dictionary(&url.to_string(), options)
            .map_err(|e| WatchError::new(ErrorKind::Unreachable, format!("ffmpeg open {}: {}", url, e)))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("camera stream has no video track")?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("read ffmpeg codec parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::BGR24,
            settings.width,
            settings.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
        })
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut bgr_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            if let Err(err) = self.decoder.send_packet(&packet) {
                log::debug!("FfmpegHttpCapture: dropping packet: {}", err);
                return Ok(ReadOutcome::NoFrame);
            }
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut bgr_frame)
                    .map_err(|e| WatchError::new(ErrorKind::DecodeFailure, format!("scale frame: {}", e)))?;
                let (pixels, width, height) = packed_pixels(&bgr_frame)?;
                return Ok(ReadOutcome::Frame(crate::frame::Frame::from_bgr(
                    pixels, width, height,
                )?));
            }
            return Ok(ReadOutcome::NoFrame);
        }

        Err(WatchError::new(ErrorKind::StreamClosed, "ffmpeg input ended").into())
    }
}

#[cfg(feature = "backend-ffmpeg")]
fn packed_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    use anyhow::Context;

    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// GStreamer over HTTP
// ----------------------------------------------------------------------------

#[cfg(feature = "backend-gstreamer")]
struct GstreamerHttpCapture {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    pull_timeout: Duration,
}

#[cfg(feature = "backend-gstreamer")]
impl GstreamerHttpCapture {
    fn new(url: &str, settings: &CaptureSettings) -> Result<Self> {
        use anyhow::Context;
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "souphttpsrc location={} is-live=true timeout={} ! multipartdemux ! jpegdec ! \
             videoconvert ! videoscale ! videorate ! \
             video/x-raw,format=BGR,width={},height={},framerate={}/1 ! \
             appsink name=appsink sync=false max-buffers={} drop=true",
            url,
            settings.read_timeout.as_secs().max(1),
            settings.width,
            settings.height,
            settings.target_fps.max(1),
            settings.buffer_frames.max(1),
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build camera pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            pull_timeout: settings.read_timeout,
        })
    }

    fn connect(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| WatchError::new(ErrorKind::Unreachable, format!("start pipeline for {}: {}", self.url, e)))?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        self.poll_bus()?;
        let timeout = gstreamer::ClockTime::from_mseconds(self.pull_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(WatchError::new(ErrorKind::StreamClosed, "gstreamer reached EOS").into());
            }
            return Ok(ReadOutcome::NoFrame);
        };
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Ok(ReadOutcome::Frame(crate::frame::Frame::from_bgr(
            pixels, width, height,
        )?))
    }

    fn release(&mut self) {
        use gstreamer::prelude::*;

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerHttpCapture: failed to stop pipeline: {}", err);
        }
    }

    fn poll_bus(&mut self) -> Result<()> {
        use gstreamer::prelude::*;
        use gstreamer::MessageView;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            match message.view() {
                MessageView::Error(err) => {
                    return Err(WatchError::new(
                        ErrorKind::StreamClosed,
                        format!(
                            "gstreamer error from {:?}: {}",
                            err.src().map(|s| s.path_string()),
                            err.error()
                        ),
                    )
                    .into());
                }
                MessageView::Eos(..) => {
                    return Err(WatchError::new(ErrorKind::StreamClosed, "gstreamer reached EOS").into());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "backend-gstreamer")]
impl Drop for GstreamerHttpCapture {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "backend-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    use anyhow::Context;

    let buffer = sample.buffer().context("camera sample missing buffer")?;
    let caps = sample.caps().context("camera sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse camera caps")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map camera buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("camera buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            target_fps: 0,
            width: 32,
            height: 24,
            buffer_frames: 1,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn parses_backend_names() -> Result<()> {
        assert_eq!(DecodeBackend::parse("FFmpeg")?, DecodeBackend::Ffmpeg);
        assert_eq!(DecodeBackend::parse(" gstreamer ")?, DecodeBackend::Gstreamer);
        assert_eq!(DecodeBackend::parse("any")?, DecodeBackend::Auto);
        assert!(DecodeBackend::parse("dshow").is_err());
        Ok(())
    }

    #[test]
    fn default_order_ends_with_auto() {
        let order = DecodeBackend::default_order();
        assert_eq!(order.last(), Some(&DecodeBackend::Auto));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn stub_uri_yields_frames_for_any_backend() -> Result<()> {
        let mut capture = BackendCapture::open(DecodeBackend::Ffmpeg, "stub://yard", settings())?;
        capture.connect()?;
        assert!(capture.is_connected());
        match capture.read_frame()? {
            ReadOutcome::Frame(frame) => assert_eq!((frame.width, frame.height), (32, 24)),
            ReadOutcome::NoFrame => panic!("expected frame"),
        }
        assert_eq!(capture.frames_read(), 1);
        capture.release();
        assert!(!capture.is_connected());
        Ok(())
    }

    #[cfg(not(feature = "backend-ffmpeg"))]
    #[test]
    fn missing_backend_fails_to_open() {
        let err = BackendCapture::open(DecodeBackend::Ffmpeg, "http://127.0.0.1:9/video", settings())
            .err()
            .expect("ffmpeg is not compiled in");
        assert_eq!(crate::kind_of(&err), Some(ErrorKind::Unreachable));
    }
}
