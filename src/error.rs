//! Error types for the booking service.

use std::time::Duration;

use serde::Serialize;

use crate::booking::state::BookingStep;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Booking flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors (local libSQL directory).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures talking to the booking directory (payers, providers, slots,
/// booking creation).
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Directory {backend} returned status {status}: {body}")]
    BadStatus {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Directory {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Booking conflict: {0}")]
    Conflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl DirectoryError {
    /// Whether retrying the same request could succeed.
    ///
    /// Conflicts and missing entities are final until the draft changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::Timeout { .. } | Self::Storage(_) => true,
            Self::BadStatus { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse { .. } | Self::Conflict(_) | Self::NotFound { .. } => false,
        }
    }
}

/// A single offending field on a wizard step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Missing or invalid fields for a step. Recovered locally: the step does
/// not advance and the fields are shown inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Step {step} is incomplete: {}", summarize(.fields))]
pub struct ValidationError {
    pub step: BookingStep,
    pub fields: Vec<FieldError>,
}

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{} ({})", f.field, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Booking creation failed. The draft is kept so the user can retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Booking submission failed: {message}")]
pub struct SubmissionError {
    pub message: String,
    pub retryable: bool,
}

impl From<&DirectoryError> for SubmissionError {
    fn from(err: &DirectoryError) -> Self {
        Self {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Errors raised by the booking flow controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("Operation {operation} is not allowed at step {current}")]
    WrongStep {
        operation: &'static str,
        current: BookingStep,
    },

    #[error("Booking flow already finished ({step})")]
    Finished { step: BookingStep },

    #[error("Still loading data for step {step}")]
    FetchInFlight { step: BookingStep },

    #[error("Loading data for step {step} failed: {message}")]
    FetchFailed {
        step: BookingStep,
        message: String,
        retryable: bool,
    },

    #[error("Data for step {step} has not been loaded")]
    NotLoaded { step: BookingStep },

    #[error("Step {step} has nothing to load")]
    NothingToLoad { step: BookingStep },

    #[error("A submission is already in flight")]
    SubmissionInFlight,
}

/// Session registry errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(uuid::Uuid),

    #[error("Maximum live sessions ({max}) reached")]
    LimitReached { max: usize },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
