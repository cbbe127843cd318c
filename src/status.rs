//! Read-only status snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::acquire::{probe, ProbeOutcome};
use crate::alert::AlertState;
use crate::history::DetectionHistoryStore;
use crate::processor::LatestDetection;
use crate::stream::StreamPublisher;

const REMOTE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Online,
    Offline,
}

/// The currently open frame source, if any.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SourceHealth {
    pub connected: bool,
    pub label: Option<String>,
    pub uri: Option<String>,
    pub frames_read: u64,
    pub opened_at: Option<DateTime<Utc>>,
    /// Why the last source went away, if it was not a clean stop.
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub active: bool,
    pub alert_state: AlertState,
    pub latest_detection: Option<LatestDetection>,
    pub source_health: SourceHealth,
    pub camera_url: String,
    pub remote_camera: Option<RemoteStatus>,
    pub frames_processed: u64,
    pub total_detections: usize,
    pub viewers: usize,
}

/// Shared state the reporter reads; borrowed from under the system lock.
pub struct StatusInputs<'a> {
    pub alert_state: AlertState,
    pub latest: Option<&'a LatestDetection>,
    pub source: &'a SourceHealth,
    pub frames_processed: u64,
}

pub struct StatusReporter {
    camera_url: String,
    probe_timeout: Duration,
}

impl StatusReporter {
    pub fn new(camera_url: &str) -> Self {
        Self {
            camera_url: camera_url.to_string(),
            probe_timeout: REMOTE_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Bounded GET against the camera. Call this outside any shared lock.
    pub fn probe_remote(&self) -> RemoteStatus {
        match probe(&self.camera_url, self.probe_timeout) {
            ProbeOutcome::Reachable { .. } => RemoteStatus::Online,
            other => {
                log::debug!("status: camera probe {:?}", other);
                RemoteStatus::Offline
            }
        }
    }

    pub fn compose(
        &self,
        inputs: StatusInputs<'_>,
        publisher: &StreamPublisher,
        history: &DetectionHistoryStore,
        remote_camera: Option<RemoteStatus>,
    ) -> StatusSnapshot {
        StatusSnapshot {
            active: publisher.is_active(),
            alert_state: inputs.alert_state,
            latest_detection: inputs.latest.cloned(),
            source_health: inputs.source.clone(),
            camera_url: self.camera_url.clone(),
            remote_camera,
            frames_processed: inputs.frames_processed,
            total_detections: history.len(),
            viewers: publisher.viewers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HistorySettings, StreamSettings};

    #[test]
    fn unreachable_camera_reports_offline() {
        let reporter =
            StatusReporter::new("http://127.0.0.1:1/video").with_probe_timeout(Duration::from_millis(300));
        assert_eq!(reporter.probe_remote(), RemoteStatus::Offline);
    }

    #[test]
    fn snapshot_serializes_documented_fields() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let history = DetectionHistoryStore::open(
            &HistorySettings {
                dir: dir.path().to_path_buf(),
                ..HistorySettings::default()
            },
            "monkey",
        )?;
        let publisher = StreamPublisher::new(&StreamSettings::default());
        let reporter = StatusReporter::new("stub://cam");
        let source = SourceHealth::default();
        let snapshot = reporter.compose(
            StatusInputs {
                alert_state: AlertState::Idle,
                latest: None,
                source: &source,
                frames_processed: 0,
            },
            &publisher,
            &history,
            Some(RemoteStatus::Online),
        );
        let json = serde_json::to_value(&snapshot)?;
        assert_eq!(json["active"], false);
        assert_eq!(json["alert_state"], "idle");
        assert_eq!(json["remote_camera"], "online");
        assert_eq!(json["total_detections"], 0);
        assert!(json["latest_detection"].is_null());
        Ok(())
    }
}
