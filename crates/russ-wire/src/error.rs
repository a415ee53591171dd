use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    TruncatedMessage { needed: usize, available: usize },

    #[error("Malformed attribute (missing '='): {0:?}")]
    MalformedAttribute(String),

    #[error("Invalid attribute key (contains '='): {0:?}")]
    InvalidAttributeKey(String),

    #[error("Invalid string: {0}")]
    InvalidString(&'static str),

    #[error("Too many {what}: {count} (max {max})")]
    TooManyEntries {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{0} trailing bytes after request")]
    TrailingBytes(usize),
}

impl WireError {
    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        WireError::TruncatedMessage { needed, available }
    }
}
