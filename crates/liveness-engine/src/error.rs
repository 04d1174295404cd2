//! Error types for liveness-engine operations.

use thiserror::Error;

/// A malformed recurrence definition.
///
/// Raised synchronously to whoever saves a schedule. A definition that fails
/// validation never becomes a [`Schedule`](crate::recurrence::Schedule), so
/// the reconciler only ever sees valid rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("recurrence definition has no schedules")]
    Empty,

    #[error("schedule {index}: unknown schedule type '{value}'")]
    UnknownType { index: usize, value: String },

    #[error("schedule {index}: invalid weekday '{value}'")]
    InvalidWeekday { index: usize, value: String },

    #[error("schedule {index}: invalid {field} '{value}', expected HH:MM")]
    InvalidTime {
        index: usize,
        field: &'static str,
        value: String,
    },

    #[error("schedule {index}: start_time {start} must be before end_time {end}")]
    StartNotBeforeEnd {
        index: usize,
        start: String,
        end: String,
    },

    #[error("schedule {index}: weekly schedules require every_n_weeks >= 1")]
    InvalidInterval { index: usize },

    #[error("schedule {index}: monthly_nth_weekday schedules require at least one position")]
    MissingPositions { index: usize },

    #[error("schedule {index}: invalid position {value}, expected 1, 2, 3, 4 or -1")]
    InvalidPosition { index: usize, value: i64 },

    #[error("schedule {index}: field '{field}' is not allowed on {kind} schedules")]
    UnexpectedField {
        index: usize,
        field: &'static str,
        kind: &'static str,
    },

    #[error("malformed recurrence definition: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Stable, machine-readable name of the error class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::TransientStorage(_) => "transient_storage",
            Self::NotFound(_) => "not_found",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether this error must escape per-entity isolation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
