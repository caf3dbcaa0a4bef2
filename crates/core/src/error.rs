//! Errors raised while validating notification payloads.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A payload a producer handed over cannot become a notification.
///
/// Nothing is written to the outbox when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A field the external system needs is absent or blank.
    #[error("{payload} is missing {field}")]
    MissingField {
        payload: &'static str,
        field: &'static str,
    },

    /// Fields are present but contradict each other.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },
}

impl DomainError {
    pub fn missing(payload: &'static str, field: &'static str) -> Self {
        Self::MissingField { payload, field }
    }
}
