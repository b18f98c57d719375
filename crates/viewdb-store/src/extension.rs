//! The extension seam: derived state maintained inside write transactions.
//!
//! An [`Extension`] is the registered definition (closures, version tag).
//! Its [`ExtensionState`] lives inside every snapshot and is updated for each
//! row change, in registration order, before the transaction commits.
//! Snapshots are cloned per write transaction, so states are expected to be
//! built from persistent (structurally shared) collections.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use viewdb_types::EntityId;

use crate::codec::AnyObject;
use crate::error::StoreResult;
use crate::hooks::RowHooks;
use crate::snapshot::Snapshot;

/// A single row mutation as seen by extension states.
#[derive(Clone, Copy, Debug)]
pub enum RowChange<'a> {
    /// The row was inserted or replaced; `object` is the new value.
    Upsert { id: &'a EntityId, object: &'a AnyObject },
    /// The row was removed.
    Remove { id: &'a EntityId },
    /// Every row in the collection was removed.
    RemoveAll { collection: &'a str },
}

impl RowChange<'_> {
    /// Collection the change applies to.
    pub fn collection(&self) -> &str {
        match self {
            Self::Upsert { id, .. } | Self::Remove { id } => id.collection(),
            Self::RemoveAll { collection } => collection,
        }
    }
}

/// Registered extension definition.
pub trait Extension: Send + Sync + 'static {
    /// Stable kind identifier ("view", "filtered-view", "hooks", ...).
    /// Re-registering a name with a different kind is rejected.
    fn kind(&self) -> &'static str;

    /// Version of the extension's logic. Changing it forces a rebuild.
    fn version_tag(&self) -> &str;

    /// Name of the extension this one derives from, if any. The parent must
    /// already be registered.
    fn parent(&self) -> Option<&str> {
        None
    }

    /// Build the state from scratch over the current snapshot.
    fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>>;

    /// Restore a state previously produced by [`ExtensionState::persist`].
    ///
    /// `Ok(None)` means the persisted bytes are unusable and the caller
    /// should fall back to [`Extension::build`].
    fn restore(
        &self,
        _ctx: &BuildContext<'_>,
        _persisted: &[u8],
    ) -> StoreResult<Option<Box<dyn ExtensionState>>> {
        Ok(None)
    }

    /// Row hooks fired by write transactions, if this extension has any.
    fn hooks(&self) -> Option<&dyn RowHooks> {
        None
    }
}

/// Per-snapshot state of an extension.
pub trait ExtensionState: Send + Sync + 'static {
    fn clone_state(&self) -> Box<dyn ExtensionState>;

    /// Apply one row change. `upstream` exposes the already-updated states of
    /// every extension registered before this one.
    fn apply(&mut self, change: &RowChange<'_>, upstream: &Upstream<'_>) -> StoreResult<()>;

    /// Serialized form written into checkpoints. `None` if not persistable.
    fn persist(&self) -> StoreResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn as_any(&self) -> &dyn Any;
}

/// State for extensions that keep nothing per snapshot (e.g. hooks).
#[derive(Clone, Debug, Default)]
pub struct StatelessState;

impl ExtensionState for StatelessState {
    fn clone_state(&self) -> Box<dyn ExtensionState> {
        Box::new(Self)
    }

    fn apply(&mut self, _change: &RowChange<'_>, _upstream: &Upstream<'_>) -> StoreResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An extension registered in a snapshot, together with its state.
pub(crate) struct ExtensionSlot {
    pub(crate) name: String,
    pub(crate) extension: Arc<dyn Extension>,
    pub(crate) state: Box<dyn ExtensionState>,
}

impl Clone for ExtensionSlot {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            extension: Arc::clone(&self.extension),
            state: self.state.clone_state(),
        }
    }
}

impl fmt::Debug for ExtensionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionSlot")
            .field("name", &self.name)
            .field("kind", &self.extension.kind())
            .field("tag", &self.extension.version_tag())
            .finish()
    }
}

/// Read-only access to the states registered before a given extension.
pub struct Upstream<'a> {
    slots: &'a [ExtensionSlot],
}

impl<'a> Upstream<'a> {
    pub(crate) fn new(slots: &'a [ExtensionSlot]) -> Self {
        Self { slots }
    }

    pub fn get(&self, name: &str) -> Option<&'a dyn ExtensionState> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.state.as_ref())
    }

    /// Typed access to an upstream state.
    pub fn state<S: 'static>(&self, name: &str) -> Option<&'a S> {
        self.get(name).and_then(|state| state.as_any().downcast_ref::<S>())
    }
}

/// Inputs available while building or restoring an extension state.
pub struct BuildContext<'a> {
    snapshot: &'a Snapshot,
    upstream: Upstream<'a>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(snapshot: &'a Snapshot, upstream: Upstream<'a>) -> Self {
        Self { snapshot, upstream }
    }

    /// The store contents the state is built over.
    pub fn snapshot(&self) -> &'a Snapshot {
        self.snapshot
    }

    pub fn upstream(&self) -> &Upstream<'a> {
        &self.upstream
    }
}

/// Persisted registration record of an extension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub kind: String,
    pub tag: String,
    pub parent: Option<String>,
}

impl RegistryEntry {
    pub(crate) fn of(name: &str, extension: &dyn Extension) -> Self {
        Self {
            name: name.to_string(),
            kind: extension.kind().to_string(),
            tag: extension.version_tag().to_string(),
            parent: extension.parent().map(str::to_string),
        }
    }

    pub(crate) fn matches(&self, extension: &dyn Extension) -> bool {
        self.kind == extension.kind() && self.tag == extension.version_tag()
    }
}

/// How a successful registration was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// First registration under this name; state built from scratch.
    Created,
    /// Same name, kind and tag as the live registration; nothing rebuilt.
    Unchanged,
    /// Same tag as the persisted registration; state loaded from the checkpoint.
    Restored,
    /// The tag changed; state (and dependents) rebuilt from scratch.
    Rebuilt,
}

impl Registration {
    /// Returns `true` if state was computed from the store contents.
    pub fn did_build(&self) -> bool {
        matches!(self, Self::Created | Self::Rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_change_collection() {
        let id = EntityId::new("messages", "m1");
        let object: AnyObject = Arc::new(1u32);
        assert_eq!(RowChange::Upsert { id: &id, object: &object }.collection(), "messages");
        assert_eq!(RowChange::Remove { id: &id }.collection(), "messages");
        assert_eq!(
            RowChange::RemoveAll { collection: "conversations" }.collection(),
            "conversations"
        );
    }

    #[test]
    fn registration_did_build() {
        assert!(Registration::Created.did_build());
        assert!(Registration::Rebuilt.did_build());
        assert!(!Registration::Unchanged.did_build());
        assert!(!Registration::Restored.did_build());
    }
}
