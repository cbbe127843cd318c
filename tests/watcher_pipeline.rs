use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use troopwatch::config::WatchdConfig;
use troopwatch::detect::SharedDetector;
use troopwatch::{
    AlertEvent, AlertSink, AlertState, BoundingBox, Detection, ErrorKind, StartOutcome,
    StopOutcome, StubBackend, Watcher,
};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingSink {
    fn on(&self) {
        self.events.lock().unwrap().push(AlertEvent::On);
    }

    fn off(&self) {
        self.events.lock().unwrap().push(AlertEvent::Off);
    }
}

/// Sink whose `on()` takes a while, so a stop can land in the middle of it.
#[derive(Default)]
struct SlowSink {
    entered: AtomicBool,
    events: Mutex<Vec<AlertEvent>>,
}

impl AlertSink for SlowSink {
    fn on(&self) {
        self.entered.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        self.events.lock().unwrap().push(AlertEvent::On);
    }

    fn off(&self) {
        self.events.lock().unwrap().push(AlertEvent::Off);
    }
}

fn config(dir: &Path, url: &str) -> WatchdConfig {
    let mut config = WatchdConfig::default();
    config.camera.url = url.to_string();
    config.camera.width = 32;
    config.camera.height = 24;
    config.camera.target_fps = 30;
    config.camera.frame_timeout = Duration::from_secs(2);
    config.camera.read_timeout = Duration::from_secs(1);
    config.camera.local_device = None;
    config.history.dir = dir.to_path_buf();
    config.history.capacity = 5;
    config.stream.idle_poll = Duration::from_millis(10);
    config
}

fn monkey(confidence: f32) -> Detection {
    Detection::new(
        "monkey",
        confidence,
        BoundingBox {
            x: 2.0,
            y: 2.0,
            w: 10.0,
            h: 8.0,
        },
    )
}

fn watcher(config: WatchdConfig, backend: StubBackend, sink: Arc<RecordingSink>) -> Result<Watcher> {
    let detector: SharedDetector = Arc::new(Mutex::new(backend));
    Watcher::new(config, detector, sink)
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn second_start_reports_already_running() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let watcher = watcher(config(dir.path(), "stub://gate"), StubBackend::new(), sink)?;

    let first = watcher.start(None)?;
    assert!(matches!(first, StartOutcome::Started { .. }));
    let second = watcher.start(None)?;
    assert_eq!(
        second,
        StartOutcome::AlreadyRunning {
            source: "remote camera (ffmpeg)".to_string()
        }
    );
    assert_eq!(watcher.open_source_count(), 1);

    assert_eq!(watcher.stop()?, StopOutcome::Stopped);
    assert_eq!(watcher.stop()?, StopOutcome::AlreadyStopped);
    assert_eq!(watcher.open_source_count(), 0);
    Ok(())
}

#[test]
fn concurrent_starts_open_one_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let watcher = watcher(config(dir.path(), "stub://gate"), StubBackend::new(), sink)?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let watcher = watcher.clone();
            std::thread::spawn(move || watcher.start(None))
        })
        .collect();
    let mut started = 0;
    for handle in handles {
        if let StartOutcome::Started { .. } = handle.join().expect("start thread")? {
            started += 1;
        }
    }
    assert_eq!(started, 1);
    assert_eq!(watcher.open_source_count(), 1);
    watcher.stop()?;
    Ok(())
}

#[test]
fn closed_source_clears_active_flag() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let watcher = watcher(config(dir.path(), "stub://gate?frames=10"), StubBackend::new(), sink)?;

    watcher.start(None)?;
    assert!(wait_until(Duration::from_secs(5), || !watcher.is_active()));
    assert!(wait_until(Duration::from_secs(2), || watcher.open_source_count() == 0));

    let status = watcher.status(false);
    assert!(!status.active);
    assert!(!status.source_health.connected);
    let last_error = status.source_health.last_error.expect("close reason");
    assert!(last_error.contains("ended after 10 frames"), "{}", last_error);
    assert_eq!(watcher.stream().err().map(|e| e.kind), Some(ErrorKind::NotActive));

    // A closed source can be restarted.
    assert!(matches!(watcher.start(Some("stub://gate"))?, StartOutcome::Started { .. }));
    watcher.stop()?;
    Ok(())
}

#[test]
fn detections_feed_history_latest_and_alerts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let watcher = watcher(
        config(dir.path(), "stub://gate"),
        StubBackend::always(vec![monkey(0.9)]),
        sink.clone(),
    )?;

    watcher.start(None)?;
    // More positive frames than the history holds.
    assert!(wait_until(Duration::from_secs(5), || watcher.status(false).frames_processed >= 7));

    let status = watcher.status(false);
    assert_eq!(status.alert_state, AlertState::Active);
    assert!(status.total_detections <= 5);

    let latest = watcher.latest_detection().expect("latest detection");
    assert!(latest.result.detected);
    assert!((latest.result.confidence - 0.9).abs() < 1e-6);
    let image = latest.image_path.expect("artifact saved");
    assert!(dir.path().join(&image).exists());

    let entries = watcher.history().list();
    assert!(!entries.is_empty() && entries.len() <= 5);
    for entry in &entries {
        let file = entry.filename.as_ref().expect("saved");
        assert!(dir.path().join(file).exists());
    }
    let jpegs = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "jpg"))
        .count();
    assert!(jpegs <= 5, "evicted artifacts must be deleted, found {}", jpegs);

    watcher.stop()?;
    assert_eq!(sink.events(), vec![AlertEvent::On, AlertEvent::Off]);
    assert_eq!(watcher.status(false).alert_state, AlertState::Idle);
    Ok(())
}

#[test]
fn detector_failures_do_not_stop_the_stream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let script = (0..5).map(|_| Err("model crashed".to_string()));
    let watcher = watcher(config(dir.path(), "stub://gate"), StubBackend::scripted(script), sink.clone())?;

    watcher.start(None)?;
    assert!(wait_until(Duration::from_secs(5), || watcher.status(false).frames_processed >= 8));
    assert!(watcher.is_active());
    assert!(watcher.history().is_empty());
    let latest = watcher.latest_detection().expect("latest detection");
    assert!(!latest.result.detected);
    assert!(latest.image_path.is_none());
    watcher.stop()?;
    assert!(sink.events().is_empty());
    Ok(())
}

#[test]
fn viewers_receive_multipart_chunks_until_stop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let watcher = watcher(config(dir.path(), "stub://gate"), StubBackend::new(), sink)?;
    watcher.start(None)?;

    let mut first = watcher.stream()?;
    let second = watcher.stream()?;
    assert_eq!(watcher.status(false).viewers, 2);
    let chunk = first.next().expect("chunk");
    assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
    assert!(chunk.ends_with(b"\xFF\xD9\r\n"));

    let reader = std::thread::spawn(move || second.count());
    std::thread::sleep(Duration::from_millis(200));
    watcher.stop()?;
    let received = reader.join().expect("viewer thread");
    assert!(received >= 1);
    assert!(first.next().is_none());
    Ok(())
}

#[test]
fn stop_during_alert_dispatch_ends_with_off() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(SlowSink::default());
    let detector: SharedDetector = Arc::new(Mutex::new(StubBackend::always(vec![monkey(0.9)])));
    let watcher = Watcher::new(config(dir.path(), "stub://gate"), detector, sink.clone())?;

    watcher.start(None)?;
    assert!(wait_until(Duration::from_secs(5), || sink.entered.load(Ordering::SeqCst)));
    watcher.stop()?;

    assert_eq!(*sink.events.lock().unwrap(), vec![AlertEvent::On, AlertEvent::Off]);
    assert_eq!(watcher.status(false).alert_state, AlertState::Idle);
    Ok(())
}
