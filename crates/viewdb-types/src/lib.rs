//! Foundation types for viewdb.
//!
//! Every other viewdb crate depends on `viewdb-types`.
//!
//! # Key Types
//!
//! - [`EntityId`] -- `{collection, key}` identity of a stored record
//! - [`Timestamp`] -- millisecond wall-clock instant with an epoch sentinel
//! - [`NodeId`] -- identifier of a remote sync node

pub mod entity;
pub mod error;
pub mod node;
pub mod timestamp;

pub use entity::EntityId;
pub use error::TypeError;
pub use node::NodeId;
pub use timestamp::Timestamp;
