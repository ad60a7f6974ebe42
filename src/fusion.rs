//! Label fusion and propagation
//!
//! Findings are aggregated into a key -> severity map first (MAX-merge), then
//! applied to target rows by deriving the same key from each row and looking
//! it up. The target table is only ever written through its label column, so
//! propagation cannot multiply or drop rows; the alignment check turns any
//! bookkeeping mistake into a hard error instead of a silent truncation.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::error::EngineError;
use crate::types::{DetectorId, LabelVector, Severity};

/// MAX-merge findings that share a key. Applying the result twice yields the
/// same labels as applying it once.
pub fn merge_max<K, I>(entries: I) -> HashMap<K, Severity>
where
    K: Eq + Hash,
    I: IntoIterator<Item = (K, Severity)>,
{
    let mut map: HashMap<K, Severity> = HashMap::new();
    for (key, severity) in entries {
        let slot = map.entry(key).or_insert(Severity::Normal);
        if severity > *slot {
            *slot = severity;
        }
    }
    map
}

/// Escalate one detector's label slot on every row whose derived key appears
/// in `map`. Returns the number of rows whose label actually rose.
pub fn apply_labels<R, K, F>(
    rows: &[R],
    labels: &mut [LabelVector],
    detector: DetectorId,
    map: &HashMap<K, Severity>,
    key_fn: F,
    table: &'static str,
) -> Result<usize, EngineError>
where
    K: Eq + Hash,
    F: Fn(&R) -> Option<K>,
{
    if rows.len() != labels.len() {
        return Err(EngineError::LabelMisaligned {
            table,
            stage: detector.key(),
            rows: rows.len(),
            labels: labels.len(),
        });
    }

    let mut raised = 0usize;
    for (row, label) in rows.iter().zip(labels.iter_mut()) {
        let Some(key) = key_fn(row) else { continue };
        if let Some(&severity) = map.get(&key) {
            if severity > label.get(detector) {
                label.set_max(detector, severity);
                raised += 1;
            }
        }
    }

    debug!(
        detector = %detector,
        table,
        keys = map.len(),
        raised,
        "labels propagated"
    );
    Ok(raised)
}
