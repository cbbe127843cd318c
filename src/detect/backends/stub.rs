use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for testing and model-less deployments.
///
/// Returns nothing by default. A script can queue per-call results (including
/// failures); once it runs out, every call returns the steady-state detections.
pub struct StubBackend {
    script: VecDeque<std::result::Result<Vec<Detection>, String>>,
    steady: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            steady: Vec::new(),
            calls: 0,
        }
    }

    /// Return `detections` on every call.
    pub fn always(detections: Vec<Detection>) -> Self {
        Self {
            steady: detections,
            ..Self::new()
        }
    }

    /// Replay `script` call by call, then fall back to no detections.
    pub fn scripted<I>(script: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<Vec<Detection>, String>>,
    {
        Self {
            script: script.into_iter().collect(),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        self.calls += 1;
        let detections = match self.script.pop_front() {
            Some(Ok(detections)) => detections,
            Some(Err(message)) => return Err(anyhow!(message)),
            None => self.steady.clone(),
        };
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect())
    }
}
