use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("timestamp out of range: {0}ms")]
    TimestampOutOfRange(i64),
}
