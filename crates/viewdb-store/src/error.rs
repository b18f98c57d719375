/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record could not be decoded as, or is not of, the requested type.
    #[error("type mismatch for {collection}/{key}: {reason}")]
    TypeMismatch {
        collection: String,
        key: String,
        reason: String,
    },

    /// The collection has no registered serializer.
    #[error("collection not registered: {0}")]
    UnknownCollection(String),

    /// The collection is already registered with a different type or format.
    #[error("collection {collection} already registered as {existing}")]
    CollectionConflict { collection: String, existing: String },

    /// No extension is registered under this name.
    #[error("extension not registered: {0}")]
    ExtensionNotFound(String),

    /// An extension could not be registered (tag collision, failed build,
    /// missing parent). The extension must not be queried.
    #[error("registration of {name} failed: {reason}")]
    ViewRegistrationFailed { name: String, reason: String },

    /// The write could not be serialized with other writers.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// A hook or caller aborted the transaction.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// A hook issued a write outside the permitted one-hop cascade.
    #[error("hook cascade violation writing {collection}/{key} at hook depth {depth}")]
    HookCascade {
        collection: String,
        key: String,
        depth: usize,
    },

    /// Serialization or deserialization failure outside of record decoding.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the journal or checkpoint files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The database has been closed.
    #[error("database is closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn type_mismatch(
        collection: &str,
        key: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            collection: collection.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
