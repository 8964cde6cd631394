mod incident_store;

pub use incident_store::{window_start, IncidentStore};
