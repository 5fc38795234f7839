//! Error types for the protocol crate.

use std::fmt;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Why a required field was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    /// The field is absent or null.
    Missing,
    /// The field is present but empty after trimming.
    Empty,
    /// The field should hold an id coercible to a finite number but does not.
    UnparseableId,
    /// The value has the wrong shape (for example a payload that is not an object).
    WrongType,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValidationReason::Missing => "is missing",
            ValidationReason::Empty => "is empty",
            ValidationReason::UnparseableId => "is not a numeric id",
            ValidationReason::WrongType => "has the wrong type",
        };
        f.write_str(text)
    }
}

/// A payload failed validation.
///
/// Names the first offending field and the document path that contains it.
/// Validation errors are permanent for the payload's current form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: required field `{field}` {reason}")]
pub struct ValidationError {
    /// Offending field name.
    pub field: String,
    /// Path of the containing document (for example `jobs/12`).
    pub path: String,
    /// Why the field was rejected.
    pub reason: ValidationReason,
}

impl ValidationError {
    /// Creates a validation error.
    pub fn new(field: impl Into<String>, path: impl Into<String>, reason: ValidationReason) -> Self {
        Self {
            field: field.into(),
            path: path.into(),
            reason,
        }
    }

    /// Creates a "missing field" error.
    pub fn missing(field: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(field, path, ValidationReason::Missing)
    }
}

/// Errors raised while decoding stored protocol records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A stored record does not have the expected structure.
    #[error("invalid record structure: {0}")]
    InvalidStructure(String),

    /// Unknown mutation type tag.
    #[error("unknown mutation type `{0}`")]
    UnknownMutation(String),

    /// Payload failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ProtocolError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
