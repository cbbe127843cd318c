mod common;

use anyhow::Result;
use std::time::Duration;

use common::{CameraFixture, CameraReply};
use troopwatch::acquire::ProbeOutcome;
use troopwatch::config::CameraSettings;
use troopwatch::ingest::DecodeBackend;
use troopwatch::{AcquisitionOrchestrator, ErrorKind, ReadOutcome, Strategy};

fn camera(url: &str) -> CameraSettings {
    CameraSettings {
        url: url.to_string(),
        probe_timeout: Duration::from_secs(2),
        frame_timeout: Duration::from_secs(3),
        read_timeout: Duration::from_secs(2),
        target_fps: 15,
        width: 64,
        height: 48,
        backends: DecodeBackend::default_order(),
        raw_fallback: true,
        local_device: None,
    }
}

#[test]
fn http_404_fails_fast_without_trying_backends() -> Result<()> {
    let fixture = CameraFixture::spawn(CameraReply::NotFound)?;
    let orchestrator = AcquisitionOrchestrator::new(camera(&fixture.url()));

    let acquisition = orchestrator.acquire(None);
    assert_eq!(
        acquisition.report.probe,
        ProbeOutcome::Rejected { http_status: 404 }
    );
    assert!(acquisition.report.attempts.is_empty());
    assert!(acquisition.source.is_none());
    // Only the probe reached the camera.
    assert_eq!(fixture.requests(), 1);

    let err = orchestrator.open(None).err().expect("404 is unreachable");
    assert_eq!(err.kind, ErrorKind::Unreachable);
    Ok(())
}

#[test]
fn http_404_falls_through_to_local_device() -> Result<()> {
    let fixture = CameraFixture::spawn(CameraReply::NotFound)?;
    let mut settings = camera(&fixture.url());
    settings.local_device = Some("stub://desk".to_string());
    let orchestrator = AcquisitionOrchestrator::new(settings);

    let acquisition = orchestrator.acquire(None);
    let strategies: Vec<Strategy> = acquisition
        .report
        .attempts
        .iter()
        .map(|a| a.strategy)
        .collect();
    assert_eq!(strategies, vec![Strategy::LocalDevice]);
    let (source, strategy) = acquisition.source.expect("local device opens");
    assert_eq!(strategy, Strategy::LocalDevice);
    assert_eq!(source.uri(), "stub://desk");
    Ok(())
}

#[test]
fn multipart_camera_opens_with_builtin_demuxer() -> Result<()> {
    let fixture = CameraFixture::spawn(CameraReply::Multipart)?;
    let orchestrator = AcquisitionOrchestrator::new(camera(&fixture.url()));

    let acquisition = orchestrator.acquire(None);
    assert!(matches!(
        acquisition.report.probe,
        ProbeOutcome::Reachable { http_status: 200, .. }
    ));
    let (mut source, strategy) = acquisition.source.expect("auto backend opens");
    assert_eq!(strategy, Strategy::Backend(DecodeBackend::Auto));
    assert_eq!(strategy.label(), "remote camera (auto)");

    // Backends that are not compiled in fail and are recorded before `auto` wins.
    let attempts = &acquisition.report.attempts;
    let last = attempts.last().expect("attempts recorded");
    assert!(last.succeeded);
    for failed in &attempts[..attempts.len() - 1] {
        assert!(!failed.succeeded);
    }

    match source.read_frame()? {
        ReadOutcome::Frame(frame) => assert_eq!((frame.width, frame.height), (64, 48)),
        ReadOutcome::NoFrame => panic!("expected a frame"),
    }
    source.release();
    assert!(!source.is_connected());
    Ok(())
}

#[test]
fn non_multipart_body_uses_raw_parser() -> Result<()> {
    let fixture = CameraFixture::spawn(CameraReply::RawMjpeg)?;
    let orchestrator = AcquisitionOrchestrator::new(camera(&fixture.url()));

    let (mut source, strategy) = orchestrator.open(None)?;
    assert_eq!(strategy, Strategy::RawStream);
    assert_eq!(strategy.label(), "remote camera (raw mjpeg)");
    let mut frames = 0;
    for _ in 0..3 {
        if let ReadOutcome::Frame(frame) = source.read_frame()? {
            assert!(!frame.is_empty());
            frames += 1;
        }
    }
    assert!(frames >= 1);
    Ok(())
}

#[test]
fn refused_connection_is_unreachable() {
    let settings = camera("http://127.0.0.1:1/video");
    let orchestrator = AcquisitionOrchestrator::new(settings);
    let acquisition = orchestrator.acquire(None);
    assert!(matches!(acquisition.report.probe, ProbeOutcome::Failed { .. }));
    assert!(acquisition.report.attempts.is_empty());
}
