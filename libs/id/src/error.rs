//! Parse errors for master-assigned and framework-chosen identifiers.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// A slave ID was handed where a framework ID belongs, or similar.
    #[error("wrong ID kind: expected '{expected}_', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// Task and executor names are chosen by frameworks and echoed in
    /// status updates, so they are restricted to printable text.
    #[error("invalid name '{value}': {reason}")]
    InvalidName { value: String, reason: &'static str },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// True for errors in a framework-chosen name rather than a
    /// master-assigned ID.
    pub fn is_name_error(&self) -> bool {
        matches!(self, IdError::InvalidName { .. })
    }
}
