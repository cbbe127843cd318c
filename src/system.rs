//! The `Watcher`: owner of process-wide state and the control surface.
//!
//! Exactly one frame-production worker runs while the system is active. It is
//! the only writer of the alert machine, the latest detection and the history;
//! request handlers only read. Start and stop serialize on the control lock,
//! so two concurrent starts can never both open a source.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::acquire::{probe, AcquisitionOrchestrator, Attempt, ProbeOutcome, Strategy};
use crate::alert::{AlertEvent, AlertSink, AlertStateMachine, DebounceWindows};
use crate::config::{validate_camera_url, CameraSettings, WatchdConfig};
use crate::detect::SharedDetector;
use crate::frame::Frame;
use crate::history::DetectionHistoryStore;
use crate::ingest::{http_agent, is_stub_uri, open_stream, FrameSource, ReadOutcome};
use crate::processor::{FrameProcessor, LatestDetection};
use crate::status::{SourceHealth, StatusInputs, StatusReporter, StatusSnapshot};
use crate::stream::{MjpegStream, PassthroughStream, StreamPublisher};
use crate::{kind_of, ErrorKind, WatchError};

const FRAME_LOG_INTERVAL: u64 = 30;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { source: String },
    AlreadyRunning { source: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Result of `Watcher::test_connection`.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionReport {
    pub camera_url: String,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    /// Strategy that produced a frame, or the running one if the stream is active.
    pub strategy: Option<Strategy>,
    pub attempts: Vec<Attempt>,
    pub message: String,
}

struct SystemState {
    alert: AlertStateMachine,
    latest: Option<LatestDetection>,
    source: SourceHealth,
    frames_processed: u64,
    sources_open: usize,
}

struct Worker {
    run: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Shared {
    config: WatchdConfig,
    orchestrator: AcquisitionOrchestrator,
    processor: FrameProcessor,
    history: DetectionHistoryStore,
    publisher: Arc<StreamPublisher>,
    alert_sink: Arc<dyn AlertSink>,
    reporter: StatusReporter,
    state: Mutex<SystemState>,
    control: Mutex<Option<Worker>>,
}

#[derive(Clone)]
pub struct Watcher {
    shared: Arc<Shared>,
}

impl Watcher {
    pub fn new(
        config: WatchdConfig,
        detector: SharedDetector,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let history = DetectionHistoryStore::open(&config.history, &config.detector.target_class)?;
        let processor = FrameProcessor::new(
            detector,
            &config.detector,
            config.camera.width,
            config.camera.height,
        );
        let state = SystemState {
            alert: AlertStateMachine::new(DebounceWindows::from(&config.alert)),
            latest: None,
            source: SourceHealth::default(),
            frames_processed: 0,
            sources_open: 0,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                orchestrator: AcquisitionOrchestrator::new(config.camera.clone()),
                processor,
                history,
                publisher: Arc::new(StreamPublisher::new(&config.stream)),
                alert_sink,
                reporter: StatusReporter::new(&config.camera.url),
                state: Mutex::new(state),
                control: Mutex::new(None),
                config,
            }),
        })
    }

    pub fn config(&self) -> &WatchdConfig {
        &self.shared.config
    }

    pub fn is_active(&self) -> bool {
        self.shared.publisher.is_active()
    }

    /// Number of frame sources currently held open by the worker.
    pub fn open_source_count(&self) -> usize {
        self.shared.lock_state().sources_open
    }

    /// Open a source and start the frame loop.
    ///
    /// `source_hint` replaces the configured camera URL for this run.
    pub fn start(&self, source_hint: Option<&str>) -> Result<StartOutcome, WatchError> {
        let mut control = self.shared.lock_control()?;
        if self.shared.publisher.is_active() {
            let source = self
                .shared
                .lock_state()
                .source
                .label
                .clone()
                .unwrap_or_default();
            return Ok(StartOutcome::AlreadyRunning { source });
        }
        if let Some(previous) = control.take() {
            self.shared.join_worker(previous);
        }
        if let Some(hint) = source_hint {
            validate_camera_url(hint).map_err(|e| WatchError::from_anyhow(ErrorKind::Config, e))?;
        }

        let (source, strategy) = self.shared.orchestrator.open(source_hint)?;
        let label = strategy.label();
        {
            let mut state = self.shared.lock_state();
            state.sources_open += 1;
            state.source = SourceHealth {
                connected: true,
                label: Some(label.clone()),
                uri: Some(source.uri().to_string()),
                frames_read: source.frames_read(),
                opened_at: Some(Utc::now()),
                last_error: None,
            };
        }

        let run = Arc::new(AtomicBool::new(true));
        self.shared.publisher.set_active(true);
        let shared = Arc::clone(&self.shared);
        let worker_run = Arc::clone(&run);
        let spawned = thread::Builder::new()
            .name("troopwatch-frames".to_string())
            .spawn(move || run_frames(shared, source, worker_run));
        match spawned {
            Ok(handle) => {
                *control = Some(Worker { run, handle });
                log::info!("watcher: started on {}", label);
                Ok(StartOutcome::Started { source: label })
            }
            Err(err) => {
                self.shared.publisher.set_active(false);
                let mut state = self.shared.lock_state();
                state.sources_open = state.sources_open.saturating_sub(1);
                state.source.connected = false;
                Err(WatchError::new(
                    ErrorKind::Io,
                    format!("spawn frame worker: {}", err),
                ))
            }
        }
    }

    /// Stop the frame loop and release the source. Idempotent.
    pub fn stop(&self) -> Result<StopOutcome, WatchError> {
        let mut control = self.shared.lock_control()?;
        let was_active = self.shared.publisher.is_active();
        let worker = control.take();
        if let Some(worker) = &worker {
            worker.run.store(false, Ordering::SeqCst);
        }
        self.shared.publisher.set_active(false);
        if let Some(worker) = worker {
            self.shared.join_worker(worker);
        }

        {
            let mut state = self.shared.lock_state();
            if let Some(event) = state.alert.reset() {
                self.shared.dispatch_alert(event);
            }
        }

        if was_active {
            log::info!("watcher: stopped");
            Ok(StopOutcome::Stopped)
        } else {
            Ok(StopOutcome::AlreadyStopped)
        }
    }

    /// Snapshot of the whole system. `probe_remote` adds a bounded camera probe.
    pub fn status(&self, probe_remote: bool) -> StatusSnapshot {
        let shared = &self.shared;
        let remote = probe_remote.then(|| shared.reporter.probe_remote());
        let state = shared.lock_state();
        shared.reporter.compose(
            StatusInputs {
                alert_state: state.alert.state(),
                latest: state.latest.as_ref(),
                source: &state.source,
                frames_processed: state.frames_processed,
            },
            &shared.publisher,
            &shared.history,
            remote,
        )
    }

    pub fn latest_detection(&self) -> Option<LatestDetection> {
        self.shared.lock_state().latest.clone()
    }

    pub fn history(&self) -> &DetectionHistoryStore {
        &self.shared.history
    }

    /// Attach a multipart viewer to the running stream.
    pub fn stream(&self) -> Result<MjpegStream, WatchError> {
        self.shared.publisher.subscribe()
    }

    /// Proxy the camera's own stream without detection.
    pub fn passthrough(&self) -> Result<PassthroughStream, WatchError> {
        let camera = self.shared.orchestrator.camera();
        let agent = http_agent(camera.probe_timeout, camera.read_timeout);
        let (content_type, body) = open_stream(&agent, &camera.url)
            .map_err(|e| WatchError::from_anyhow(ErrorKind::Unreachable, e))?;
        log::info!("watcher: passthrough opened to {}", camera.url);
        Ok(PassthroughStream::new(content_type, body))
    }

    /// Probe the camera and check that some strategy can decode it.
    ///
    /// While the stream is running the camera is not opened a second time;
    /// the running strategy is reported instead.
    pub fn test_connection(&self) -> Result<ConnectionReport, WatchError> {
        let camera = self.shared.orchestrator.camera();
        let outcome = if is_stub_uri(&camera.url) {
            ProbeOutcome::Skipped
        } else {
            probe(&camera.url, camera.probe_timeout)
        };
        let (http_status, content_type) = match outcome {
            ProbeOutcome::Skipped => (None, None),
            ProbeOutcome::Reachable {
                http_status,
                content_type,
            } => (Some(http_status), Some(content_type)),
            ProbeOutcome::Rejected { http_status } => {
                return Err(WatchError::new(
                    ErrorKind::Unreachable,
                    format!("camera returned HTTP {}", http_status),
                ))
            }
            ProbeOutcome::Failed { error } => {
                return Err(WatchError::new(
                    ErrorKind::Unreachable,
                    format!("cannot connect to camera: {}", error),
                ))
            }
        };

        let (strategy, attempts) = if self.is_active() {
            let label = self.shared.lock_state().source.label.clone();
            log::info!("watcher: connection test while streaming from {:?}", label);
            (self.running_strategy(), Vec::new())
        } else {
            let dry_run = AcquisitionOrchestrator::new(CameraSettings {
                local_device: None,
                ..camera.clone()
            });
            let acquisition = dry_run.acquire(None);
            let strategy = acquisition.source.map(|(mut source, strategy)| {
                source.release();
                strategy
            });
            (strategy, acquisition.report.attempts)
        };

        let message = match &strategy {
            Some(strategy) => format!("camera reachable; frames decode via {}", strategy.label()),
            None => "camera reachable but no strategy produced a frame".to_string(),
        };
        Ok(ConnectionReport {
            camera_url: camera.url.clone(),
            http_status,
            content_type,
            strategy,
            attempts,
            message,
        })
    }

    fn running_strategy(&self) -> Option<Strategy> {
        let label = self.shared.lock_state().source.label.clone()?;
        let camera = self.shared.orchestrator.camera();
        camera
            .backends
            .iter()
            .map(|backend| Strategy::Backend(*backend))
            .chain([Strategy::RawStream, Strategy::LocalDevice])
            .find(|strategy| strategy.label() == label)
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SystemState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_control(&self) -> Result<MutexGuard<'_, Option<Worker>>, WatchError> {
        self.control
            .lock()
            .map_err(|_| WatchError::new(ErrorKind::Io, "control lock poisoned"))
    }

    fn dispatch_alert(&self, event: AlertEvent) {
        log::info!("watcher: alert {:?}", event);
        self.alert_sink.dispatch(event);
    }

    /// Wait for a stopped worker, bounded by one read timeout.
    fn join_worker(&self, worker: Worker) {
        let deadline = Instant::now() + self.config.camera.read_timeout + Duration::from_secs(1);
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                log::error!("watcher: frame worker panicked");
            }
        } else {
            log::warn!("watcher: frame worker still blocked in a read; detaching it");
        }
    }

    fn handle_frame(&self, frame: Frame, run: &AtomicBool, frames_read: u64) {
        let processed = match self.processor.process(frame) {
            Ok(processed) => processed,
            Err(err) => {
                log::warn!("watcher: skipping frame: {:#}", err);
                return;
            }
        };

        let image_path = if processed.result.detected {
            self.history
                .record(&processed.annotated, processed.result.confidence)
                .entry
                .filename
        } else {
            None
        };

        let count = {
            let mut state = self.lock_state();
            if !run.load(Ordering::SeqCst) {
                return;
            }
            state.frames_processed += 1;
            state.source.frames_read = frames_read;
            state.latest = Some(LatestDetection {
                result: processed.result.clone(),
                image_path,
            });
            // Dispatch under the state lock; stop() resets the alert under the same lock.
            if let Some(event) = state
                .alert
                .observe(processed.result.detected, processed.annotated.captured_at)
            {
                self.dispatch_alert(event);
            }
            state.frames_processed
        };
        if count % FRAME_LOG_INTERVAL == 0 {
            log::info!("watcher: processing frame {}", count);
        }
        if let Err(err) = self.publisher.publish(&processed.annotated) {
            log::warn!("watcher: failed to publish frame: {:#}", err);
        }
    }
}

fn run_frames(shared: Arc<Shared>, mut source: FrameSource, run: Arc<AtomicBool>) {
    let idle_poll = shared.config.stream.idle_poll;
    let closed = loop {
        if !run.load(Ordering::SeqCst) || !shared.publisher.is_active() {
            break None;
        }
        match source.read_frame() {
            Ok(ReadOutcome::Frame(frame)) => {
                let frames_read = source.frames_read();
                shared.handle_frame(frame, &run, frames_read);
            }
            Ok(ReadOutcome::NoFrame) => thread::sleep(idle_poll),
            Err(err) if kind_of(&err) == Some(ErrorKind::StreamClosed) => {
                log::warn!("watcher: source closed: {:#}", err);
                break Some(format!("{:#}", err));
            }
            Err(err) => {
                log::warn!("watcher: frame read failed: {:#}", err);
                thread::sleep(READ_RETRY_DELAY);
            }
        }
    };

    source.release();
    // Still owning the run means the source died on its own, not via stop().
    let unattended = run.swap(false, Ordering::SeqCst);
    if unattended {
        shared.publisher.set_active(false);
    }
    {
        let mut state = shared.lock_state();
        state.sources_open = state.sources_open.saturating_sub(1);
        state.source.connected = false;
        state.source.frames_read = source.frames_read();
        state.source.last_error = closed;
        if unattended {
            if let Some(event) = state.alert.reset() {
                shared.dispatch_alert(event);
            }
        }
    }
    log::info!("watcher: frame worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlertSink;
    use crate::detect::StubBackend;

    fn watcher(dir: &std::path::Path, url: &str) -> Watcher {
        let mut config = WatchdConfig::default();
        config.camera.url = url.to_string();
        config.camera.width = 32;
        config.camera.height = 24;
        config.camera.target_fps = 50;
        config.camera.frame_timeout = Duration::from_secs(1);
        config.camera.read_timeout = Duration::from_secs(1);
        config.camera.local_device = None;
        config.history.dir = dir.to_path_buf();
        config.stream.idle_poll = Duration::from_millis(10);
        let detector: SharedDetector = Arc::new(Mutex::new(StubBackend::new()));
        Watcher::new(config, detector, Arc::new(LogAlertSink::new("monkey"))).unwrap()
    }

    #[test]
    fn stop_when_idle_is_a_no_op() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let watcher = watcher(dir.path(), "stub://cam");
        assert_eq!(watcher.stop()?, StopOutcome::AlreadyStopped);
        assert_eq!(watcher.stream().err().map(|e| e.kind), Some(ErrorKind::NotActive));
        Ok(())
    }

    #[test]
    fn start_reports_source_label_and_stop_releases() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let watcher = watcher(dir.path(), "stub://cam");
        let outcome = watcher.start(None)?;
        assert_eq!(
            outcome,
            StartOutcome::Started {
                source: "remote camera (ffmpeg)".to_string()
            }
        );
        assert!(watcher.is_active());
        assert_eq!(watcher.open_source_count(), 1);

        assert_eq!(watcher.stop()?, StopOutcome::Stopped);
        assert!(!watcher.is_active());
        assert_eq!(watcher.open_source_count(), 0);
        assert!(!watcher.status(false).source_health.connected);
        Ok(())
    }

    #[test]
    fn bad_source_hint_is_a_config_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let watcher = watcher(dir.path(), "stub://cam");
        let err = watcher.start(Some("ftp://camera/video")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(!watcher.is_active());
        Ok(())
    }

    #[test]
    fn connection_test_on_stub_reports_strategy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let watcher = watcher(dir.path(), "stub://cam");
        let report = watcher.test_connection()?;
        assert_eq!(report.http_status, None);
        assert!(report.strategy.is_some());
        assert_eq!(watcher.open_source_count(), 0);
        Ok(())
    }
}
