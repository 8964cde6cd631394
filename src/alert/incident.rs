use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::IncidentStore;

use super::notifier::AlertBus;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("encoder refused to write {0}")]
    NotWritten(String),
}

/// One authorized alert. Serialises to the sink's JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub name: String,
    pub camera_id: usize,
    pub timestamp: String,
    pub filename: String,
}

impl IncidentRecord {
    /// The stored name is the sanitized label, matching the filename.
    pub fn new(label: &str, camera_id: usize, at: DateTime<Local>) -> Self {
        let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
        let name = sanitize_label(label);
        let filename = incident_filename(&timestamp, camera_id, &name);
        Self {
            name,
            camera_id,
            timestamp,
            filename,
        }
    }

    /// Recover a record from an `<timestamp>_cam<id>_<label>.jpg` name.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".jpg")?;
        // timestamp is `YYYYmmdd_HHMMSS`, exactly two underscore-separated parts
        let mut parts = stem.splitn(4, '_');
        let date = parts.next()?;
        let time = parts.next()?;
        let camera = parts.next()?.strip_prefix("cam")?;
        let name = parts.next()?;

        if date.len() != 8 || time.len() != 6 || name.is_empty() {
            return None;
        }
        if !date.chars().chain(time.chars()).all(|c| c.is_ascii_digit()) {
            return None;
        }
        let camera_id = camera.parse().ok()?;

        Some(Self {
            name: name.to_string(),
            camera_id,
            timestamp: format!("{date}_{time}"),
            filename: filename.to_string(),
        })
    }
}

pub fn incident_filename(timestamp: &str, camera_id: usize, label: &str) -> String {
    format!("{timestamp}_cam{camera_id}_{}.jpg", sanitize_label(label))
}

/// Replace anything outside `[A-Za-z0-9_-]` so a label is safe as a path component.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Persists snapshots of authorized alerts and hands them to subscribers.
pub struct IncidentLogger {
    dir: PathBuf,
    store: IncidentStore,
    bus: AlertBus,
}

impl IncidentLogger {
    pub fn new(dir: PathBuf, store: IncidentStore, bus: AlertBus) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(path = %dir.display(), error = %e, "failed to create incidents directory");
        }
        Self { dir, store, bus }
    }

    /// Record an incident. Snapshot and delivery failures are logged only;
    /// the incident counts as fired either way.
    pub fn log(&self, frame: &Mat, label: &str, camera_id: usize, at: DateTime<Local>) -> IncidentRecord {
        let record = IncidentRecord::new(label, camera_id, at);
        let path = self.dir.join(&record.filename);

        tracing::warn!(label = %label, camera = camera_id, "watchlist match");

        match write_snapshot(&path, frame) {
            Ok(()) => tracing::info!(file = %record.filename, "incident logged"),
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "failed to write incident snapshot")
            }
        }

        self.store.insert(record.clone());
        self.bus.publish(record.clone());
        record
    }
}

fn write_snapshot(path: &Path, frame: &Mat) -> Result<(), IncidentError> {
    let path_str = path.to_string_lossy();
    if imgcodecs::imwrite(&path_str, frame, &Vector::<i32>::new())? {
        Ok(())
    } else {
        Err(IncidentError::NotWritten(path_str.into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::testing::{solid_frame, temp_dir};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn test_record_fields() {
        let record = IncidentRecord::new("alice", 2, at(14, 5, 9));
        assert_eq!(record.timestamp, "20240309_140509");
        assert_eq!(record.filename, "20240309_140509_cam2_alice.jpg");
    }

    #[test]
    fn test_json_body() {
        let record = IncidentRecord::new("alice", 0, at(1, 2, 3));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "alice",
                "camera_id": 0,
                "timestamp": "20240309_010203",
                "filename": "20240309_010203_cam0_alice.jpg",
            })
        );
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("john_doe"), "john_doe");
        assert_eq!(sanitize_label("Jane Doe"), "Jane_Doe");
        assert_eq!(sanitize_label("../etc"), "___etc");
        assert_eq!(sanitize_label(""), "_");
    }

    #[test]
    fn test_filename_roundtrip() {
        let record = IncidentRecord::new("mary_ann", 12, at(23, 59, 1));
        let parsed = IncidentRecord::from_filename(&record.filename).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_live_record_matches_rescanned_record() {
        let record = IncidentRecord::new("Jane Doe", 3, at(7, 30, 0));
        assert_eq!(record.name, "Jane_Doe");
        assert_eq!(record.filename, "20240309_073000_cam3_Jane_Doe.jpg");
        assert_eq!(IncidentRecord::from_filename(&record.filename), Some(record));
    }

    #[test]
    fn test_from_filename_rejects_foreign_names() {
        assert!(IncidentRecord::from_filename("snapshot.jpg").is_none());
        assert!(IncidentRecord::from_filename("20240309_140509_cam2_alice.png").is_none());
        assert!(IncidentRecord::from_filename("20240309_140509_camX_alice.jpg").is_none());
        assert!(IncidentRecord::from_filename("2024_140509_cam2_alice.jpg").is_none());
    }

    #[test]
    fn test_log_writes_snapshot_and_records() {
        let dir = temp_dir("incident-log");
        let store = IncidentStore::new(10);
        let bus = AlertBus::new(4);
        let mut rx = bus.subscribe();
        let logger = IncidentLogger::new(dir.clone(), store.clone(), bus);

        let frame = solid_frame(32, 24, 80.0);
        let record = logger.log(&frame, "alice", 1, at(8, 0, 0));

        assert!(dir.join(&record.filename).is_file());
        assert_eq!(store.recent(10), vec![record.clone()]);
        assert_eq!(rx.try_recv().unwrap(), record);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_write_still_records() {
        let dir = temp_dir("incident-unwritable");
        // a regular file where the directory should be
        let blocked = dir.join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let store = IncidentStore::new(10);
        let logger = IncidentLogger::new(blocked.clone(), store.clone(), AlertBus::new(4));

        let record = logger.log(&solid_frame(8, 8, 1.0), "bob", 0, at(9, 0, 0));
        assert!(!blocked.join(&record.filename).exists());
        assert_eq!(store.recent(1).len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
