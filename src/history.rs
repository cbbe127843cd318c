//! Bounded detection history with on-disk JPEG artifacts.
//!
//! Entries are kept oldest-first and capped at `capacity`. Evicting an entry
//! deletes its artifact while the history lock is held, so a reader holding
//! the lock sees either the entry and its file, or neither.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::config::HistorySettings;
use crate::frame::Frame;
use crate::{ErrorKind, WatchError};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionHistoryEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    /// Artifact filename inside the history directory; `None` if the save failed.
    pub filename: Option<String>,
}

#[derive(Debug)]
pub struct RecordOutcome {
    pub entry: DetectionHistoryEntry,
    /// Oldest entry dropped to stay within capacity.
    pub evicted: Option<DetectionHistoryEntry>,
}

pub struct DetectionHistoryStore {
    dir: PathBuf,
    capacity: usize,
    jpeg_quality: u8,
    file_prefix: String,
    entries: Mutex<VecDeque<DetectionHistoryEntry>>,
    next_id: AtomicU64,
}

impl DetectionHistoryStore {
    /// Create the artifact directory if needed. Files already in it are left alone.
    pub fn open(settings: &HistorySettings, target_class: &str) -> Result<Self> {
        fs::create_dir_all(&settings.dir).with_context(|| {
            format!("create detection directory {}", settings.dir.display())
        })?;
        if settings.capacity == 0 {
            return Err(anyhow!("history capacity must be at least 1"));
        }
        Ok(Self {
            dir: settings.dir.clone(),
            capacity: settings.capacity,
            jpeg_quality: settings.jpeg_quality,
            file_prefix: slug(target_class),
            entries: Mutex::new(VecDeque::with_capacity(settings.capacity + 1)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Save `frame` as a JPEG artifact and append an entry for it.
    ///
    /// A failed save is logged and the entry is still recorded, without a filename.
    pub fn record(&self, frame: &Frame, confidence: f32) -> RecordOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timestamp = Utc::now();
        let filename = format!(
            "{}_detected_{}_{}.jpg",
            self.file_prefix,
            timestamp.format("%Y%m%d_%H%M%S_%6f"),
            id
        );

        let saved = frame
            .encode_jpeg(self.jpeg_quality)
            .and_then(|jpeg| write_atomic(&self.dir.join(&filename), &jpeg));
        let filename = match saved {
            Ok(()) => Some(filename),
            Err(err) => {
                log::warn!("history: failed to save {}: {:#}", filename, err);
                None
            }
        };

        let entry = DetectionHistoryEntry {
            id,
            timestamp,
            confidence,
            filename,
        };

        let mut entries = self.lock();
        entries.push_back(entry.clone());
        let evicted = if entries.len() > self.capacity {
            entries.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            if let Some(old_file) = &old.filename {
                match fs::remove_file(self.dir.join(old_file)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => log::warn!("history: failed to delete {}: {}", old_file, err),
                }
            }
            log::info!("history: evicted detection {} (capacity {})", old.id, self.capacity);
        }
        drop(entries);

        if let Some(name) = &entry.filename {
            log::info!("history: saved {} (confidence {:.2})", name, confidence);
        }
        RecordOutcome { entry, evicted }
    }

    /// Entries in insertion order, oldest first.
    pub fn list(&self) -> Vec<DetectionHistoryEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Result<DetectionHistoryEntry, WatchError> {
        self.lock()
            .back()
            .cloned()
            .ok_or_else(|| WatchError::new(ErrorKind::NotFound, "no detections recorded"))
    }

    /// Bytes of a recorded artifact. Names outside the artifact pattern are rejected.
    pub fn artifact(&self, filename: &str) -> Result<Vec<u8>, WatchError> {
        if !is_artifact_name(filename) {
            return Err(WatchError::new(
                ErrorKind::NotFound,
                format!("{} is not a detection artifact", filename),
            ));
        }
        let entries = self.lock();
        if !entries
            .iter()
            .any(|e| e.filename.as_deref() == Some(filename))
        {
            return Err(WatchError::new(
                ErrorKind::NotFound,
                format!("{} is not in the detection history", filename),
            ));
        }
        fs::read(self.dir.join(filename)).map_err(|e| {
            WatchError::new(ErrorKind::Io, format!("read {}: {}", filename, e))
        })
    }

    /// Newest entry that has an artifact, with its bytes.
    pub fn latest_artifact(&self) -> Result<(DetectionHistoryEntry, Vec<u8>), WatchError> {
        let entries = self.lock();
        let entry = entries
            .iter()
            .rev()
            .find(|e| e.filename.is_some())
            .cloned()
            .ok_or_else(|| WatchError::new(ErrorKind::NotFound, "no detection images saved"))?;
        let filename = entry.filename.as_deref().unwrap_or_default();
        let bytes = fs::read(self.dir.join(filename))
            .map_err(|e| WatchError::new(ErrorKind::Io, format!("read {}: {}", filename, e)))?;
        Ok((entry, bytes))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DetectionHistoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn is_artifact_name(filename: &str) -> bool {
    static ARTIFACT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ARTIFACT_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_]{1,64}_detected_[0-9]{8}_[0-9]{6}_[0-9]{6}_[0-9]{1,20}\.jpg$")
            .unwrap()
    });
    re.is_match(filename)
}

fn slug(label: &str) -> String {
    let slug: String = label
        .trim()
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "target".to_string()
    } else {
        slug
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, capacity: usize) -> DetectionHistoryStore {
        let settings = HistorySettings {
            dir: dir.to_path_buf(),
            capacity,
            jpeg_quality: 80,
        };
        DetectionHistoryStore::open(&settings, "Monkey").unwrap()
    }

    fn frame() -> Frame {
        Frame::from_bgr(vec![120u8; 16 * 12 * 3], 16, 12).unwrap()
    }

    #[test]
    fn evicts_oldest_and_deletes_its_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), 3);
        let mut files = Vec::new();
        for i in 0..5 {
            let outcome = store.record(&frame(), 0.5 + i as f32 / 10.0);
            files.push(outcome.entry.filename.clone().expect("saved"));
            assert!(store.len() <= 3);
            if i < 3 {
                assert!(outcome.evicted.is_none());
            } else {
                let evicted = outcome.evicted.expect("evicted");
                let gone = evicted.filename.expect("had a file");
                assert!(!dir.path().join(gone).exists());
            }
        }
        let remaining = store.list();
        assert_eq!(remaining.len(), 3);
        assert_eq!(
            remaining.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        for entry in &remaining {
            assert!(dir.path().join(entry.filename.as_ref().unwrap()).exists());
        }
        assert!(!dir.path().join(&files[0]).exists());
        assert!(!dir.path().join(&files[1]).exists());
        Ok(())
    }

    #[test]
    fn artifact_names_are_guarded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), 5);
        let entry = store.record(&frame(), 0.9).entry;
        let name = entry.filename.expect("saved");
        assert!(name.starts_with("monkey_detected_"), "{}", name);
        assert!(is_artifact_name(&name));

        let bytes = store.artifact(&name)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        for bad in ["../secret.jpg", "monkey_detected_x.jpg", "/etc/passwd"] {
            let err = store.artifact(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::NotFound);
        }
        Ok(())
    }

    #[test]
    fn latest_on_empty_store_is_not_found() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), 5);
        assert_eq!(store.latest().unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(store.latest_artifact().unwrap_err().kind, ErrorKind::NotFound);
        store.record(&frame(), 0.7);
        store.record(&frame(), 0.8);
        assert_eq!(store.latest()?.id, 2);
        let (entry, bytes) = store.latest_artifact()?;
        assert_eq!(entry.id, 2);
        assert!(!bytes.is_empty());
        Ok(())
    }

    #[test]
    fn failed_save_still_records_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), 5);
        fs::remove_dir_all(dir.path())?;
        let outcome = store.record(&frame(), 0.6);
        assert!(outcome.entry.filename.is_none());
        assert_eq!(store.len(), 1);
        Ok(())
    }
}
