//! Engine integrity errors.
//!
//! Detector findings are joined back onto the source tables by key lookup, so
//! a propagation step can never multiply rows. These errors exist to make the
//! row-count contract explicit: every propagation and partition step verifies
//! it and aborts instead of silently truncating.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A table's label column drifted out of alignment with its rows.
    #[error("{table}: label column misaligned during {stage} ({rows} rows, {labels} labels)")]
    LabelMisaligned {
        table: &'static str,
        stage: &'static str,
        rows: usize,
        labels: usize,
    },

    /// A step changed the number of rows it was required to preserve.
    #[error("{stage}: row count changed (before {before}, after {after})")]
    RowCountViolation {
        stage: &'static str,
        before: usize,
        after: usize,
    },
}
