//! Acquisition cascade.
//!
//! `AcquisitionOrchestrator` turns a camera URL into one open `FrameSource`:
//!
//! 1. Probe the URL with a plain GET. Anything but 200 (or no answer) skips
//!    every remote strategy.
//! 2. Try each configured decoding backend, polling for a first valid frame.
//! 3. Fall back to the raw MJPEG parser.
//! 4. Fall back to the local device.
//!
//! Every strategy is bounded by `frame_timeout`, and every failed strategy is
//! released before the next one starts.

use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::CameraSettings;
use crate::ingest::{
    http_agent, http_get, is_stub_uri, BackendCapture, CaptureSettings, DecodeBackend,
    FrameSource, LocalDeviceCapture, RawStreamParser, ReadOutcome,
};
use crate::{ErrorKind, WatchError};

const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which rung of the cascade produced the open source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Backend(DecodeBackend),
    RawStream,
    LocalDevice,
}

impl Strategy {
    /// Human-readable source label reported by `start` and status.
    pub fn label(&self) -> String {
        match self {
            Strategy::Backend(backend) => format!("remote camera ({})", backend),
            Strategy::RawStream => "remote camera (raw mjpeg)".to_string(),
            Strategy::LocalDevice => "local device (fallback)".to_string(),
        }
    }
}

impl Serialize for Strategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// Result of the HTTP probe in front of the remote strategies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// `stub://` URLs are never probed.
    Skipped,
    Reachable { http_status: u16, content_type: String },
    Rejected { http_status: u16 },
    Failed { error: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Skipped | ProbeOutcome::Reachable { .. })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Attempt {
    pub strategy: Strategy,
    pub succeeded: bool,
    pub detail: String,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct AcquisitionReport {
    pub uri: String,
    pub probe: ProbeOutcome,
    pub attempts: Vec<Attempt>,
}

impl AcquisitionReport {
    fn summary(&self) -> String {
        if self.attempts.is_empty() {
            return format!("{} not reachable ({:?}) and no fallback configured", self.uri, self.probe);
        }
        let tried: Vec<String> = self
            .attempts
            .iter()
            .map(|a| format!("{}: {}", a.strategy.label(), a.detail))
            .collect();
        format!("no source for {} opened; tried {}", self.uri, tried.join("; "))
    }
}

pub struct Acquisition {
    pub report: AcquisitionReport,
    pub source: Option<(FrameSource, Strategy)>,
}

pub struct AcquisitionOrchestrator {
    camera: CameraSettings,
}

impl AcquisitionOrchestrator {
    pub fn new(camera: CameraSettings) -> Self {
        Self { camera }
    }

    pub fn camera(&self) -> &CameraSettings {
        &self.camera
    }

    /// Open the first working source, or fail with `ErrorKind::Unreachable`.
    pub fn open(&self, uri_override: Option<&str>) -> Result<(FrameSource, Strategy), WatchError> {
        let acquisition = self.acquire(uri_override);
        match acquisition.source {
            Some(opened) => Ok(opened),
            None => Err(WatchError::new(
                ErrorKind::Unreachable,
                acquisition.report.summary(),
            )),
        }
    }

    /// Walk the cascade and report every step, whether or not a source opened.
    pub fn acquire(&self, uri_override: Option<&str>) -> Acquisition {
        let uri = uri_override.unwrap_or(&self.camera.url).to_string();
        let mut report = AcquisitionReport {
            uri: uri.clone(),
            probe: ProbeOutcome::Skipped,
            attempts: Vec::new(),
        };

        if !is_stub_uri(&uri) {
            log::info!("acquire: probing {}", uri);
            report.probe = probe(&uri, self.camera.probe_timeout);
        }

        if report.probe.is_reachable() {
            log::info!("acquire: {} reachable ({:?})", uri, report.probe);
            if let Some(opened) = self.try_remote(&uri, &mut report) {
                return Acquisition {
                    report,
                    source: Some(opened),
                };
            }
        } else {
            log::warn!(
                "acquire: {} not reachable ({:?}); skipping remote strategies",
                uri,
                report.probe
            );
        }

        if let Some(device) = self.camera.local_device.as_deref() {
            log::warn!("acquire: falling back to local device {}", device);
            let source = FrameSource::LocalDevice(LocalDeviceCapture::new(
                device,
                self.camera.width,
                self.camera.height,
                self.camera.target_fps,
            ));
            if let Some(source) = self.attempt(Strategy::LocalDevice, Ok(source), &mut report) {
                return Acquisition {
                    report,
                    source: Some((source, Strategy::LocalDevice)),
                };
            }
        }

        log::warn!("acquire: {}", report.summary());
        Acquisition {
            report,
            source: None,
        }
    }

    fn try_remote(
        &self,
        uri: &str,
        report: &mut AcquisitionReport,
    ) -> Option<(FrameSource, Strategy)> {
        let settings = CaptureSettings::from_camera(&self.camera);
        for backend in &self.camera.backends {
            let strategy = Strategy::Backend(*backend);
            let source = BackendCapture::open(*backend, uri, settings.clone()).map(FrameSource::Backend);
            if let Some(source) = self.attempt(strategy, source, report) {
                return Some((source, strategy));
            }
        }

        if self.camera.raw_fallback {
            let source = FrameSource::RawStream(RawStreamParser::new(
                uri,
                self.camera.probe_timeout,
                self.camera.read_timeout,
            ));
            if let Some(source) = self.attempt(Strategy::RawStream, Ok(source), report) {
                return Some((source, Strategy::RawStream));
            }
        }
        None
    }

    /// Connect `source` and wait for one valid frame. Releases it on failure.
    fn attempt(
        &self,
        strategy: Strategy,
        source: Result<FrameSource>,
        report: &mut AcquisitionReport,
    ) -> Option<FrameSource> {
        let started = Instant::now();
        log::info!("acquire: trying {}", strategy.label());
        let outcome = source.and_then(|mut source| {
            let result = source
                .connect()
                .and_then(|_| self.await_first_frame(&mut source));
            match result {
                Ok(detail) => Ok((source, detail)),
                Err(err) => {
                    source.release();
                    Err(err)
                }
            }
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((source, detail)) => {
                log::info!("acquire: {} working ({})", strategy.label(), detail);
                report.attempts.push(Attempt {
                    strategy,
                    succeeded: true,
                    detail,
                    elapsed_ms,
                });
                Some(source)
            }
            Err(err) => {
                log::warn!("acquire: {} failed: {:#}", strategy.label(), err);
                report.attempts.push(Attempt {
                    strategy,
                    succeeded: false,
                    detail: format!("{:#}", err),
                    elapsed_ms,
                });
                None
            }
        }
    }

    fn await_first_frame(&self, source: &mut FrameSource) -> Result<String> {
        let deadline = Instant::now() + self.camera.frame_timeout;
        loop {
            match source.read_frame() {
                Ok(ReadOutcome::Frame(frame)) if !frame.is_empty() => {
                    return Ok(format!("first frame {}x{}", frame.width, frame.height));
                }
                Ok(_) => {}
                Err(err) if crate::kind_of(&err) == Some(ErrorKind::DecodeFailure) => {
                    log::debug!("acquire: skipping undecodable frame: {:#}", err);
                }
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(WatchError::new(
                    ErrorKind::Unreachable,
                    format!(
                        "no valid frame within {}s",
                        self.camera.frame_timeout.as_secs_f32()
                    ),
                )
                .into());
            }
            std::thread::sleep(FRAME_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

/// Bounded GET against `url`. The body is never read.
pub fn probe(url: &str, timeout: Duration) -> ProbeOutcome {
    let agent = http_agent(timeout, timeout);
    match http_get(&agent, url) {
        Ok(reply) if reply.status == 200 => ProbeOutcome::Reachable {
            http_status: reply.status,
            content_type: reply.content_type,
        },
        Ok(reply) => ProbeOutcome::Rejected {
            http_status: reply.status,
        },
        Err(err) => ProbeOutcome::Failed {
            error: format!("{:#}", err),
        },
    }
}
