use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector collaborator.
///
/// Given a frame and a confidence threshold, returns every detection at or
/// above the threshold. Implementations may be slow and may fail; callers
/// treat failures as per-frame and keep going.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a BGR frame.
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
