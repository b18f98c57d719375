use viewdb_store::StoreError;
use viewdb_types::{EntityId, NodeId, TypeError};

/// Errors from link operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The links extension has not been installed on this database.
    #[error("node links are not installed")]
    NotInstalled,

    /// The node is already linked to a different record.
    #[error("node {node} is already linked to {existing}")]
    NodeAlreadyLinked { node: NodeId, existing: EntityId },

    /// The record is already linked to a different node.
    #[error("{id} is already linked to node {existing}")]
    EntityAlreadyLinked { id: EntityId, existing: NodeId },

    #[error("invalid node id: {0}")]
    InvalidNodeId(#[from] TypeError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience alias for link results.
pub type LinkResult<T> = Result<T, LinkError>;

impl From<LinkError> for StoreError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Store(inner) => inner,
            other => StoreError::Aborted(other.to_string()),
        }
    }
}
