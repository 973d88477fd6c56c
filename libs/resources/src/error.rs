use thiserror::Error;

/// Resource parsing and arithmetic errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Text could not be parsed.
    #[error("parse error in '{entry}': {reason}")]
    Parse { entry: String, reason: String },

    /// Two dimensions with the same name have different kinds.
    #[error("resource '{name}' is a {existing} but was combined with a {incoming}")]
    KindMismatch {
        name: String,
        existing: &'static str,
        incoming: &'static str,
    },

    /// Subtraction would take a dimension below zero, or remove range/set
    /// elements that are not present.
    #[error("resource '{name}' underflow: cannot take {wanted} from {available}")]
    Underflow {
        name: String,
        wanted: String,
        available: String,
    },

    /// A scalar was negative or not finite.
    #[error("invalid scalar {0}: must be finite and non-negative")]
    InvalidScalar(String),
}

impl ResourceError {
    pub(crate) fn parse(entry: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }
}
