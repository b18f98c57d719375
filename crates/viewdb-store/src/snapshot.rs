use std::any::{Any, TypeId};
use std::sync::Arc;

use viewdb_types::EntityId;

use crate::codec::{AnyObject, CollectionSchema};
use crate::error::{StoreError, StoreResult};
use crate::extension::{ExtensionSlot, ExtensionState};
use crate::row::Row;

pub(crate) type Rows = im::HashMap<String, Arc<Row>>;

/// An immutable, point-in-time view of the whole database.
///
/// Committed snapshots are shared behind `Arc` by readers; a write
/// transaction works on a private clone, which is cheap because every map is
/// a persistent structure.
#[derive(Clone, Default)]
pub struct Snapshot {
    pub(crate) seq: u64,
    pub(crate) schemas: im::HashMap<String, Arc<CollectionSchema>>,
    pub(crate) rows: im::HashMap<String, Rows>,
    pub(crate) extensions: Vec<ExtensionSlot>,
}

impl Snapshot {
    /// Sequence number of the commit that produced this snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn schema(&self, collection: &str) -> Option<&Arc<CollectionSchema>> {
        self.schemas.get(collection)
    }

    fn require_schema(&self, collection: &str) -> StoreResult<&Arc<CollectionSchema>> {
        self.schemas
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }

    pub(crate) fn row(&self, collection: &str, key: &str) -> Option<&Arc<Row>> {
        self.rows.get(collection).and_then(|rows| rows.get(key))
    }

    /// Typed read. Fails with `TypeMismatch` if `T` is not the collection's
    /// registered type or the stored bytes do not decode.
    pub fn get<T: Any + Send + Sync>(&self, collection: &str, key: &str) -> StoreResult<Option<Arc<T>>> {
        let schema = self.require_schema(collection)?;
        if schema.record_type_id() != TypeId::of::<T>() {
            return Err(StoreError::type_mismatch(
                collection,
                key,
                format!(
                    "collection holds {}, requested {}",
                    schema.type_name(),
                    std::any::type_name::<T>()
                ),
            ));
        }
        let Some(row) = self.row(collection, key) else {
            return Ok(None);
        };
        let object = row.object(schema, key)?;
        object.downcast::<T>().map(Some).map_err(|_| {
            StoreError::type_mismatch(collection, key, "decoded object has unexpected type")
        })
    }

    /// Untyped read of the decoded object.
    pub fn object(&self, collection: &str, key: &str) -> StoreResult<Option<AnyObject>> {
        let schema = self.require_schema(collection)?;
        self.row(collection, key)
            .map(|row| row.object(schema, key))
            .transpose()
    }

    /// Every `(key, object)` in a collection, sorted by key.
    pub fn objects(&self, collection: &str) -> StoreResult<Vec<(String, AnyObject)>> {
        let Some(rows) = self.rows.get(collection) else {
            return Ok(Vec::new());
        };
        let schema = self.require_schema(collection)?;
        let mut out = rows
            .iter()
            .map(|(key, row)| Ok((key.clone(), row.object(schema, key)?)))
            .collect::<StoreResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn has(&self, collection: &str, key: &str) -> bool {
        self.row(collection, key).is_some()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.has(id.collection(), id.key())
    }

    /// Keys of a collection, sorted.
    pub fn keys(&self, collection: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .rows
            .get(collection)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn count(&self, collection: &str) -> usize {
        self.rows.get(collection).map_or(0, |rows| rows.len())
    }

    /// Names of all registered or populated collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .schemas
            .keys()
            .chain(self.rows.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn extension_state(&self, name: &str) -> Option<&dyn ExtensionState> {
        self.extensions
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.state.as_ref())
    }

    /// Registered extension names, in registration order.
    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.iter().map(|slot| slot.name.clone()).collect()
    }

    pub(crate) fn slot_index(&self, name: &str) -> Option<usize> {
        self.extensions.iter().position(|slot| slot.name == name)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let row_count: usize = self.rows.values().map(|rows| rows.len()).sum();
        f.debug_struct("Snapshot")
            .field("seq", &self.seq)
            .field("collections", &self.schemas.len())
            .field("rows", &row_count)
            .field("extensions", &self.extension_names())
            .finish()
    }
}
