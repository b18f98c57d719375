//! Link lookups and edits on transactions.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;
use viewdb_store::{Reader, WriteTransaction};
use viewdb_types::{EntityId, NodeId};

use crate::error::{LinkError, LinkResult};
use crate::index::{LinkIndex, LinkRecord, LINKS_COLLECTION, LINKS_EXTENSION};

/// Link queries for anything that can read the store.
///
/// Lookups on a database without [`NodeLinks`](crate::NodeLinks) installed
/// behave as if no link exists.
pub trait LinkReader: Reader {
    fn link_index(&self) -> Option<&LinkIndex> {
        self.ext::<LinkIndex>(LINKS_EXTENSION)
    }

    /// The record linked to `node`.
    fn linked_entity(&self, node: &NodeId) -> Option<&EntityId> {
        self.link_index().and_then(|index| index.entity_for(node))
    }

    fn linked_collection_and_key(&self, node: &NodeId) -> Option<(&str, &str)> {
        self.linked_entity(node).map(|id| (id.collection(), id.key()))
    }

    fn linked_collection(&self, node: &NodeId) -> Option<&str> {
        self.linked_entity(node).map(EntityId::collection)
    }

    fn linked_key(&self, node: &NodeId) -> Option<&str> {
        self.linked_entity(node).map(EntityId::key)
    }

    /// The node linked to `collection/key`.
    fn linked_node_id(&self, collection: &str, key: &str) -> Option<&NodeId> {
        self.link_index()
            .and_then(|index| index.node_for(&EntityId::new(collection, key)))
    }

    fn is_node_linked(&self, node: &NodeId) -> bool {
        self.linked_entity(node).is_some()
    }

    /// The record linked to `node`, typed.
    fn linked_object<T: Any + Send + Sync>(&self, node: &NodeId) -> LinkResult<Option<Arc<T>>> {
        match self.linked_entity(node) {
            Some(id) => Ok(self.get::<T>(id.collection(), id.key())?),
            None => Ok(None),
        }
    }
}

impl<R: Reader + ?Sized> LinkReader for R {}

/// Link edits inside a write transaction.
pub trait LinkWriter {
    /// Link `node` to `collection/key`.
    ///
    /// Links are one-to-one. Re-linking the same pair succeeds; linking
    /// either side to something else fails. A link whose record does not
    /// exist when the transaction commits is dropped.
    fn link(&mut self, node: &NodeId, collection: &str, key: &str) -> LinkResult<()>;

    /// Remove the link on `collection/key`, returning the node it pointed at.
    fn unlink(&mut self, collection: &str, key: &str) -> LinkResult<Option<NodeId>>;

    /// Remove the link on `node`, returning the record it pointed at.
    fn unlink_node(&mut self, node: &NodeId) -> LinkResult<Option<EntityId>>;
}

impl LinkWriter for WriteTransaction {
    fn link(&mut self, node: &NodeId, collection: &str, key: &str) -> LinkResult<()> {
        let index = self.link_index().ok_or(LinkError::NotInstalled)?;
        let id = EntityId::new(collection, key);

        if let Some(existing) = index.entity_for(node) {
            if existing == &id {
                return Ok(());
            }
            return Err(LinkError::NodeAlreadyLinked {
                node: node.clone(),
                existing: existing.clone(),
            });
        }
        if let Some(existing) = index.node_for(&id) {
            return Err(LinkError::EntityAlreadyLinked {
                id,
                existing: existing.clone(),
            });
        }

        debug!(node = %node, target = %id, "linking node");
        self.set(
            LINKS_COLLECTION,
            node.as_str(),
            LinkRecord {
                collection: collection.to_string(),
                key: key.to_string(),
            },
        )?;
        Ok(())
    }

    fn unlink(&mut self, collection: &str, key: &str) -> LinkResult<Option<NodeId>> {
        let index = self.link_index().ok_or(LinkError::NotInstalled)?;
        let Some(node) = index.node_for(&EntityId::new(collection, key)).cloned() else {
            return Ok(None);
        };
        self.remove(LINKS_COLLECTION, node.as_str())?;
        Ok(Some(node))
    }

    fn unlink_node(&mut self, node: &NodeId) -> LinkResult<Option<EntityId>> {
        let index = self.link_index().ok_or(LinkError::NotInstalled)?;
        let Some(id) = index.entity_for(node).cloned() else {
            return Ok(None);
        };
        self.remove(LINKS_COLLECTION, node.as_str())?;
        Ok(Some(id))
    }
}
