//! Derived views for viewdb.
//!
//! Views are store extensions: their state lives in every snapshot and is
//! updated inside the write transaction that changes the underlying rows,
//! so a committed view is never stale.
//!
//! # Key Types
//!
//! - [`AutoView`] -- groups records with one closure and sorts each group with another
//! - [`FilteredView`] -- keeps the members of a parent view that pass a predicate
//! - [`ViewHandle`] -- positional and membership queries, via [`ViewAccess::view`]

pub mod auto;
pub mod error;
pub mod filtered;
pub mod handle;
pub(crate) mod layout;
pub mod state;

pub use auto::{AutoView, ViewOptions};
pub use error::{ViewError, ViewResult};
pub use filtered::FilteredView;
pub use handle::{ViewAccess, ViewHandle};
pub use layout::ViewEntry;
pub use state::ViewState;
