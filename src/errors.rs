// src/errors.rs
use thiserror::Error;

/// Failures of the analytics core that callers are expected to branch on.
///
/// Everything I/O related (fetching, persistence) travels as `anyhow::Error`
/// with context instead.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Too few students or events for a stage to produce a meaningful result.
    #[error("insufficient data for {stage}: found {found}, need at least {required}")]
    InsufficientData {
        stage: &'static str,
        found: usize,
        required: usize,
    },

    /// A single record could not be interpreted. Batches skip and count these.
    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    /// A Q-value left the sanity bound; the run is aborted and the previous
    /// snapshot stays authoritative.
    #[error("training diverged at episode {episode}: |Q| reached {max_abs_q:.3e} (bound {bound:.3e})")]
    TrainingDivergence {
        max_abs_q: f64,
        bound: f64,
        episode: usize,
    },

    /// A Q-table was trained against a different action catalog.
    #[error("action catalog mismatch: table built for {found}, catalog is {expected}")]
    CatalogMismatch { expected: String, found: String },

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A policy was published with a version not newer than the live one.
    #[error("stale policy for course {course_id}: version {version} is not newer than {current}")]
    StaleSnapshot {
        course_id: String,
        version: u64,
        current: u64,
    },
}

impl AnalyticsError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
        }
    }

    /// True for outcomes that skip a run without flagging it for operators.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

/// Classification of upstream fetch failures. Only transient ones are retried.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
