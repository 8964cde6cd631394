use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Per-identity alert suppression window.
pub struct CooldownGate {
    window: Duration,
    last_alert: Mutex<HashMap<String, Instant>>,
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Authorize an alert for `label` at `now` and record it if granted.
    ///
    /// The lookup and the update happen under one lock, so concurrent callers
    /// cannot both be granted the same window.
    pub fn authorize(&self, label: &str, now: Instant) -> bool {
        let mut last_alert = self.last_alert.lock().unwrap_or_else(PoisonError::into_inner);

        let allowed = match last_alert.get(label) {
            Some(&last) => now.saturating_duration_since(last) >= self.window,
            None => true,
        };

        if allowed {
            last_alert.insert(label.to_string(), now);
        }
        allowed
    }

    #[cfg(test)]
    pub fn last_alert(&self, label: &str) -> Option<Instant> {
        self.last_alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .copied()
    }
}
