//! One-to-one links between cloud node ids and local records.
//!
//! A sync layer addresses remote nodes by [`NodeId`](viewdb_types::NodeId);
//! the app addresses records by collection and key. [`NodeLinks`] keeps the
//! mapping in its own collection so it commits with the records it names.
//!
//! # Key Types
//!
//! - [`NodeLinks`] -- the store extension; install once per database
//! - [`LinkReader`] -- lookups in both directions on any reader
//! - [`LinkWriter`] -- `link` / `unlink` inside a write transaction
//!
//! # Design Rules
//!
//! 1. A node links to at most one record and a record to at most one node.
//! 2. Removing a linked record removes its link in the same commit.
//! 3. A link whose record is missing at commit time is dropped.

pub mod access;
pub mod error;
pub mod index;

pub use access::{LinkReader, LinkWriter};
pub use error::{LinkError, LinkResult};
pub use index::{LinkIndex, LinkRecord, NodeLinks, LINKS_COLLECTION, LINKS_EXTENSION};
