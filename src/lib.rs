//! troopwatch
//!
//! Watches a remote camera for a target object class and re-publishes the
//! annotated feed to any number of HTTP viewers.
//!
//! # Architecture
//!
//! One frame-production loop per process, fed by exactly one `FrameSource`:
//!
//! 1. **Acquisition**: `AcquisitionOrchestrator` probes the camera URL and walks the
//!    fallback cascade (decoding backends, raw MJPEG parser, local device).
//! 2. **Processing**: `FrameProcessor` resizes, runs the detector collaborator and
//!    extracts target-class detections.
//! 3. **Alerting**: `AlertStateMachine` debounces "target seen" into on/off events.
//! 4. **History**: `DetectionHistoryStore` keeps a bounded log of positive detections
//!    with their JPEG artifacts on disk.
//! 5. **Publishing**: `StreamPublisher` fans annotated frames out to every connected
//!    multipart viewer.
//! 6. **Status**: `StatusReporter` composes a read-only snapshot of all of the above.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (decoding backends, raw MJPEG, local device)
//! - `acquire`: fallback cascade over the frame sources
//! - `detect`: detector collaborator boundary and backends
//! - `system`: the `Watcher` that owns shared state and the control surface
//! - `api`: HTTP control and streaming server

pub mod acquire;
pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod history;
pub mod ingest;
pub mod processor;
pub mod status;
pub mod stream;
pub mod system;

pub use acquire::{Acquisition, AcquisitionOrchestrator, AcquisitionReport, Strategy};
pub use alert::{AlertEvent, AlertSink, AlertState, AlertStateMachine, DebounceWindows, LogAlertSink};
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, StubBackend};
pub use frame::Frame;
pub use history::{DetectionHistoryEntry, DetectionHistoryStore, RecordOutcome};
pub use ingest::{FrameSource, ReadOutcome};
pub use processor::{DetectionResult, FrameProcessor, LatestDetection, Processed};
pub use status::{RemoteStatus, SourceHealth, StatusReporter, StatusSnapshot};
pub use stream::{MjpegStream, StreamPublisher};
pub use system::{StartOutcome, StopOutcome, Watcher};

// -------------------- Error taxonomy --------------------

/// Distinguishing kind of a control-surface or per-frame failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No frame source strategy succeeded.
    Unreachable,
    /// An open source stopped yielding data.
    StreamClosed,
    /// Bytes were received but are not a valid image.
    DecodeFailure,
    /// The detector collaborator failed.
    DetectionFailure,
    /// The operation needs a running stream.
    NotActive,
    NotFound,
    Config,
    Io,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::StreamClosed => "stream_closed",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::DetectionFailure => "detection_failure",
            ErrorKind::NotActive => "not_active",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WatchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Convert an `anyhow::Error`, keeping the kind of any `WatchError` in its chain.
    pub fn from_anyhow(fallback: ErrorKind, err: anyhow::Error) -> Self {
        let kind = kind_of(&err).unwrap_or(fallback);
        Self {
            kind,
            message: format!("{:#}", err),
        }
    }
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for WatchError {}

/// Find the first `WatchError` kind in an error chain.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<WatchError>())
        .map(|e| e.kind)
}
