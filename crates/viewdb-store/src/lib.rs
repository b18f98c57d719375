//! Embedded object store for viewdb.
//!
//! Records live in named collections under string keys. Each collection is
//! bound to one Rust type and a wire [`Format`]. Readers work on immutable
//! [`Snapshot`]s and never block the single writer.
//!
//! # Key Types
//!
//! - [`Database`] -- the store handle: registration, transactions, subscriptions
//! - [`ReadTransaction`] / [`WriteTransaction`] -- snapshot reads and atomic writes
//! - [`Extension`] / [`ExtensionState`] -- derived state kept current inside writes
//! - [`RowHooks`] -- per-row callbacks whose writes join the same commit
//! - [`Changeset`] -- what one commit changed, broadcast to subscribers
//!
//! # Design Rules
//!
//! 1. A write transaction commits entirely or not at all.
//! 2. Extension states and hook writes are part of the commit that caused them.
//! 3. Hooks may write one hop away; a hook fired by a hook write may not write.
//! 4. With a data directory, every commit is journaled before it becomes visible.

pub mod changeset;
pub(crate) mod checkpoint;
pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod extension;
pub mod hooks;
pub mod journal;
pub(crate) mod row;
pub mod snapshot;
pub mod transaction;

pub use changeset::{Change, ChangeKind, Changeset, ChangesetBuilder};
pub use codec::{AnyObject, CollectionSchema, Format, Record};
pub use config::{StoreConfig, SyncMode};
pub use database::Database;
pub use error::{StoreError, StoreResult};
pub use extension::{
    BuildContext, Extension, ExtensionState, Registration, RegistryEntry, RowChange,
    StatelessState, Upstream,
};
pub use hooks::RowHooks;
pub use snapshot::Snapshot;
pub use transaction::{ReadTransaction, Reader, WriteTransaction};
