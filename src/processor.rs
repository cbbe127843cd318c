//! Per-frame processing: resize, detect, annotate.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::config::DetectorSettings;
use crate::detect::{Detection, SharedDetector};
use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

// BGR order: these land as red and green once encoded.
const TARGET_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const OTHER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;

/// Outcome of running detection on one frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detected: bool,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub class_label: String,
}

impl DetectionResult {
    pub fn empty(class_label: &str) -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            timestamp: Utc::now(),
            class_label: class_label.to_string(),
        }
    }
}

/// Shared snapshot of the most recent frame's result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatestDetection {
    #[serde(flatten)]
    pub result: DetectionResult,
    /// Artifact filename saved for this detection, if any.
    pub image_path: Option<String>,
}

#[derive(Debug)]
pub struct Processed {
    pub annotated: Frame,
    pub result: DetectionResult,
    pub detections: Vec<Detection>,
    /// False when the detector failed and `annotated` is the plain frame.
    pub detector_ok: bool,
}

pub struct FrameProcessor {
    detector: SharedDetector,
    target_class: String,
    confidence_threshold: f32,
    width: u32,
    height: u32,
}

impl FrameProcessor {
    pub fn new(detector: SharedDetector, settings: &DetectorSettings, width: u32, height: u32) -> Self {
        Self {
            detector,
            target_class: settings.target_class.clone(),
            confidence_threshold: settings.confidence_threshold,
            width,
            height,
        }
    }

    /// Resize, detect and annotate one frame.
    ///
    /// An error means the frame could not be resized and should be skipped.
    /// Detector failures are not errors: the resized frame comes back
    /// unannotated with `detected == false`.
    pub fn process(&self, frame: Frame) -> Result<Processed> {
        let frame = frame
            .resized(self.width, self.height)
            .context("resize frame to working resolution")?;

        let detections = match self.run_detector(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                let err = WatchError::from_anyhow(ErrorKind::DetectionFailure, err);
                log::warn!("processor: passing frame through: {}", err);
                return Ok(Processed {
                    annotated: frame,
                    result: DetectionResult::empty(&self.target_class),
                    detections: Vec::new(),
                    detector_ok: false,
                });
            }
        };

        let best = detections
            .iter()
            .filter(|d| d.is_class(&self.target_class))
            .map(|d| d.confidence)
            .fold(None, |best: Option<f32>, c| Some(best.map_or(c, |b| b.max(c))));
        let result = DetectionResult {
            detected: best.is_some(),
            confidence: best.unwrap_or(0.0),
            timestamp: Utc::now(),
            class_label: self.target_class.clone(),
        };
        if result.detected {
            log::debug!(
                "processor: {} detected (confidence {:.2})",
                self.target_class,
                result.confidence
            );
        }

        let annotated = if detections.is_empty() {
            frame
        } else {
            self.annotate(&frame, &detections).unwrap_or_else(|err| {
                log::warn!("processor: annotation failed: {:#}", err);
                frame
            })
        };

        Ok(Processed {
            annotated,
            result,
            detections,
            detector_ok: true,
        })
    }

    fn run_detector(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| anyhow::anyhow!("detector lock poisoned"))?;
        detector.detect(frame, self.confidence_threshold)
    }

    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame> {
        let mut canvas = frame.as_bgr_image()?;
        for detection in detections {
            let color = if detection.is_class(&self.target_class) {
                TARGET_COLOR
            } else {
                OTHER_COLOR
            };
            for inset in 0..BOX_THICKNESS {
                let x = detection.bbox.x.round() as i32 + inset;
                let y = detection.bbox.y.round() as i32 + inset;
                let w = detection.bbox.w.round() as i32 - 2 * inset;
                let h = detection.bbox.h.round() as i32 - 2 * inset;
                if w <= 0 || h <= 0 {
                    break;
                }
                draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w as u32, h as u32), color);
            }
        }
        Ok(Frame::from_bgr_image(canvas, frame.captured_at))
    }
}
