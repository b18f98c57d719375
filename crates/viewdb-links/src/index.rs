//! The link table and its reverse index.

use std::any::Any;

use serde::{Deserialize, Serialize};
use tracing::debug;
use viewdb_store::{
    BuildContext, ChangeKind, Database, Extension, ExtensionState, Format, Reader, RowChange,
    RowHooks, StoreResult, Upstream, WriteTransaction,
};
use viewdb_types::{EntityId, NodeId};

/// Collection holding one [`LinkRecord`] per linked node, keyed by node id.
pub const LINKS_COLLECTION: &str = "viewdb.links";

/// Extension name the link index registers under.
pub const LINKS_EXTENSION: &str = "viewdb.links";

/// Target of a link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub collection: String,
    pub key: String,
}

impl LinkRecord {
    pub fn entity(&self) -> EntityId {
        EntityId::new(self.collection.as_str(), self.key.as_str())
    }
}

/// Both directions of every link in one snapshot.
#[derive(Clone, Debug, Default)]
pub struct LinkIndex {
    by_node: im::HashMap<NodeId, EntityId>,
    by_entity: im::HashMap<EntityId, NodeId>,
}

impl LinkIndex {
    pub fn entity_for(&self, node: &NodeId) -> Option<&EntityId> {
        self.by_node.get(node)
    }

    pub fn node_for(&self, id: &EntityId) -> Option<&NodeId> {
        self.by_entity.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    fn insert(&mut self, node: NodeId, id: EntityId) {
        self.remove_node(&node);
        self.by_entity.insert(id.clone(), node.clone());
        self.by_node.insert(node, id);
    }

    fn remove_node(&mut self, node: &NodeId) {
        if let Some(id) = self.by_node.remove(node) {
            self.by_entity.remove(&id);
        }
    }
}

impl ExtensionState for LinkIndex {
    fn clone_state(&self) -> Box<dyn ExtensionState> {
        Box::new(self.clone())
    }

    fn apply(&mut self, change: &RowChange<'_>, _upstream: &Upstream<'_>) -> StoreResult<()> {
        if change.collection() != LINKS_COLLECTION {
            return Ok(());
        }
        match change {
            RowChange::Upsert { id, object } => {
                let (Ok(node), Some(record)) =
                    (NodeId::new(id.key()), object.downcast_ref::<LinkRecord>())
                else {
                    return Ok(());
                };
                self.insert(node, record.entity());
            }
            RowChange::Remove { id } => {
                if let Ok(node) = NodeId::new(id.key()) {
                    self.remove_node(&node);
                }
            }
            RowChange::RemoveAll { .. } => *self = Self::default(),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Store extension maintaining [`LinkIndex`] and pruning dangling links
/// before every commit.
#[derive(Debug, Default)]
pub struct NodeLinks;

impl NodeLinks {
    /// Register the link collection and the index on `db`.
    pub fn install(db: &Database) -> StoreResult<()> {
        db.register_collection::<LinkRecord>(LINKS_COLLECTION, Format::Bincode)?;
        db.register(LINKS_EXTENSION, NodeLinks)?;
        Ok(())
    }
}

impl Extension for NodeLinks {
    fn kind(&self) -> &'static str {
        "links"
    }

    fn version_tag(&self) -> &str {
        "1"
    }

    fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>> {
        let mut index = LinkIndex::default();
        for (key, object) in ctx.snapshot().objects(LINKS_COLLECTION)? {
            if let (Ok(node), Some(record)) =
                (NodeId::new(key), object.downcast_ref::<LinkRecord>())
            {
                index.insert(node, record.entity());
            }
        }
        debug!(links = index.len(), "link index built");
        Ok(Box::new(index))
    }

    fn hooks(&self) -> Option<&dyn RowHooks> {
        Some(self)
    }
}

impl RowHooks for NodeLinks {
    /// Drop links whose record was removed in this transaction, and links
    /// created in this transaction whose record never appeared.
    fn will_commit(&self, txn: &mut WriteTransaction) -> StoreResult<()> {
        let Some(index) = txn.ext::<LinkIndex>(LINKS_EXTENSION) else {
            return Ok(());
        };

        let mut dangling: Vec<NodeId> = Vec::new();
        for change in txn.pending_changes().iter() {
            if change.id.is_in(LINKS_COLLECTION) {
                if matches!(change.kind, ChangeKind::Inserted | ChangeKind::Updated) {
                    let Ok(node) = NodeId::new(change.id.key()) else {
                        continue;
                    };
                    if let Some(target) = index.entity_for(&node) {
                        if !txn.snapshot().contains(target) {
                            dangling.push(node);
                        }
                    }
                }
            } else if change.kind == ChangeKind::Removed {
                if let Some(node) = index.node_for(&change.id) {
                    dangling.push(node.clone());
                }
            }
        }

        dangling.sort();
        dangling.dedup();
        for node in dangling {
            debug!(node = %node, "dropping dangling link");
            txn.remove(LINKS_COLLECTION, node.as_str())?;
        }
        Ok(())
    }
}
