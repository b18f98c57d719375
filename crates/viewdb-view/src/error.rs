//! Error types for the view crate.

use viewdb_store::StoreError;

/// Errors from querying views.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// No extension is registered under this name (or it is not ready yet).
    #[error("view not registered: {0}")]
    NotRegistered(String),

    /// The extension registered under this name is not a view.
    #[error("extension {0} is not a view")]
    NotAView(String),

    /// The view holds objects of a different type than requested.
    #[error("view {view} does not hold {requested}")]
    TypeMismatch { view: String, requested: &'static str },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience alias for view results.
pub type ViewResult<T> = Result<T, ViewError>;
