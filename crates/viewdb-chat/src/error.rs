use thiserror::Error;
use viewdb_store::StoreError;

#[derive(Debug, Error)]
pub enum ChatError {
    /// A view or hook failed to register; it must not be queried.
    #[error("extension {name} is not ready: {reason}")]
    ExtensionNotReady { name: String, reason: String },

    #[error("invalid chat configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("view error: {0}")]
    View(#[from] viewdb_view::ViewError),

    #[error("link error: {0}")]
    Link(#[from] viewdb_links::LinkError),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl From<ChatError> for StoreError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Store(inner) => inner,
            ChatError::View(viewdb_view::ViewError::Store(inner)) => inner,
            other => StoreError::Aborted(other.to_string()),
        }
    }
}
