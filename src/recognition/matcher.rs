use super::engine::{Encoding, FaceEngine};
use super::registry::KnownFace;

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Outcome of comparing one observed encoding against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Label of the best entry within tolerance, `None` for an unknown face.
    pub label: Option<String>,
    /// Distance to the closest registry entry, if the registry is not empty.
    pub distance: Option<f32>,
    /// Registry index of the closest entry.
    pub index: Option<usize>,
}

impl MatchResult {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }

    pub fn is_known(&self) -> bool {
        self.label.is_some()
    }
}

/// Pick the registry entry with minimum distance to `candidate`.
///
/// Every entry is compared; on equal distances the earliest entry wins.
/// The result is labelled only if that minimum is within `tolerance`.
pub fn best_match(
    engine: &dyn FaceEngine,
    candidate: &Encoding,
    known: &[KnownFace],
    tolerance: f32,
) -> MatchResult {
    let mut best: Option<(usize, f32)> = None;

    for (i, face) in known.iter().enumerate() {
        let distance = engine.distance(&face.encoding, candidate);
        let closer = match best {
            None => true,
            Some((_, best_distance)) => distance < best_distance,
        };
        if closer {
            best = Some((i, distance));
        }
    }

    match best {
        Some((idx, distance)) if distance <= tolerance => MatchResult {
            label: Some(known[idx].label.clone()),
            distance: Some(distance),
            index: Some(idx),
        },
        Some((idx, distance)) => MatchResult {
            label: None,
            distance: Some(distance),
            index: Some(idx),
        },
        None => MatchResult {
            label: None,
            distance: None,
            index: None,
        },
    }
}
