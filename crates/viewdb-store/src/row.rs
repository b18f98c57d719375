use std::sync::{Arc, OnceLock};

use crate::codec::{AnyObject, CollectionSchema};
use crate::error::{StoreError, StoreResult};

/// A stored record: its serialized bytes plus the decoded object.
///
/// Rows written in the current process carry their object from the start.
/// Rows loaded from disk decode on first access and cache the result.
#[derive(Debug)]
pub(crate) struct Row {
    bytes: Arc<[u8]>,
    object: OnceLock<AnyObject>,
}

impl Row {
    pub(crate) fn with_object(bytes: Vec<u8>, object: AnyObject) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(object);
        Self {
            bytes: bytes.into(),
            object: cell,
        }
    }

    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
            object: OnceLock::new(),
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoded object, decoding with `schema` on first access.
    pub(crate) fn object(&self, schema: &CollectionSchema, key: &str) -> StoreResult<AnyObject> {
        if let Some(object) = self.object.get() {
            return Ok(Arc::clone(object));
        }
        let decoded = schema
            .decode(&self.bytes)
            .map_err(|reason| StoreError::type_mismatch(schema.name(), key, reason))?;
        // Another reader may have raced us; either copy is equivalent.
        let _ = self.object.set(Arc::clone(&decoded));
        Ok(decoded)
    }
}
