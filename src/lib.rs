//! Abuse Scoring Engine Library
//!
//! A batch engine that labels advertising click traffic with fraud/abuse
//! severities across ten independent detectors, fuses the labels onto the
//! participation, settlement and report tables, and rolls them up into
//! entity-level risk scores.

pub mod config;
pub mod detectors;
pub mod error;
pub mod fusion;
pub mod identity;
pub mod partition;
pub mod pipeline;
pub mod quota;
pub mod scoring;
pub mod types;

pub use config::EngineConfig;
pub use error::EngineError;
pub use identity::IdentityResolver;
pub use pipeline::{AbuseEngine, EngineOutput};
pub use scoring::ScoreReport;
pub use types::{EventStore, LabelVector, Severity};
