mod cooldown;
mod incident;
mod notifier;

pub use cooldown::CooldownGate;
pub use incident::{sanitize_label, IncidentLogger, IncidentRecord, TIMESTAMP_FORMAT};
pub use notifier::{spawn_notifier, AlertBus};
