use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Local, TimeDelta};
use serde::Serialize;

use crate::alert::{IncidentRecord, TIMESTAMP_FORMAT};

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct IncidentStats {
    pub total_alerts: usize,
    pub unique_people: usize,
    pub alerts_by_person: BTreeMap<String, usize>,
    pub alerts_by_camera: BTreeMap<String, usize>,
    pub alerts_by_hour: BTreeMap<String, usize>,
}

/// Every sighting of one label, oldest first.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct PersonHistory {
    pub name: String,
    pub total_alerts: usize,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub cameras_seen: Vec<String>,
    pub alert_times: Vec<String>,
}

/// Timestamp `days` before `now`, or `None` for no window (`days == 0`).
///
/// Incident timestamps sort lexically, so the result compares directly
/// against [`IncidentRecord::timestamp`].
pub fn window_start(days: u32, now: DateTime<Local>) -> Option<String> {
    if days == 0 {
        return None;
    }
    let start = now.checked_sub_signed(TimeDelta::try_days(i64::from(days))?)?;
    Some(start.format(TIMESTAMP_FORMAT).to_string())
}

fn in_window(record: &IncidentRecord, since: Option<&str>) -> bool {
    since.is_none_or(|start| record.timestamp.as_str() > start)
}

/// Bounded in-memory history of fired incidents, oldest first internally.
pub struct IncidentStore {
    entries: Arc<RwLock<VecDeque<IncidentRecord>>>,
    capacity: usize,
}

impl IncidentStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, record: IncidentRecord) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<IncidentRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn for_label(&self, label: &str, limit: usize) -> Vec<IncidentRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|r| r.name == label)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Aggregate counts over incidents newer than `since` (all when `None`).
    pub fn stats(&self, since: Option<&str>) -> IncidentStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = IncidentStats::default();

        for record in entries.iter().filter(|r| in_window(r, since)) {
            stats.total_alerts += 1;
            *stats.alerts_by_person.entry(record.name.clone()).or_default() += 1;
            *stats
                .alerts_by_camera
                .entry(record.camera_id.to_string())
                .or_default() += 1;
            // timestamp is `YYYYmmdd_HHMMSS`
            if let Some(hour) = record.timestamp.get(9..11) {
                *stats.alerts_by_hour.entry(format!("{hour}:00")).or_default() += 1;
            }
        }
        stats.unique_people = stats.alerts_by_person.len();
        stats
    }

    pub fn person_history(&self, name: &str, since: Option<&str>) -> PersonHistory {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut sightings: Vec<&IncidentRecord> = entries
            .iter()
            .filter(|r| r.name == name && in_window(r, since))
            .collect();
        sightings.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut cameras: Vec<usize> = sightings.iter().map(|r| r.camera_id).collect();
        cameras.sort_unstable();
        cameras.dedup();

        PersonHistory {
            name: name.to_string(),
            total_alerts: sightings.len(),
            first_seen: sightings.first().map(|r| r.timestamp.clone()),
            last_seen: sightings.last().map(|r| r.timestamp.clone()),
            cameras_seen: cameras.iter().map(|c| c.to_string()).collect(),
            alert_times: sightings.iter().map(|r| r.timestamp.clone()).collect(),
        }
    }

    /// Rebuild the history from snapshot names already in `dir`.
    pub fn scan(&self, dir: &Path) -> usize {
        let read_dir = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(_) => return 0,
        };

        let mut records: Vec<IncidentRecord> = read_dir
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                IncidentRecord::from_filename(name.to_str()?)
            })
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.filename.cmp(&b.filename)));

        let count = records.len();
        for record in records {
            self.insert(record);
        }
        if count > 0 {
            tracing::info!(path = %dir.display(), incidents = count, "scanned existing incidents");
        }
        count
    }
}

impl Clone for IncidentStore {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            capacity: self.capacity,
        }
    }
}
