//! Per-collection serialization.
//!
//! Each collection is bound to exactly one Rust type and one wire
//! [`Format`]. The store keeps the bytes (for the journal and checkpoints)
//! next to the decoded object, and decodes persisted bytes lazily on first
//! access.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A decoded, immutable record as shared between snapshots and views.
pub type AnyObject = Arc<dyn Any + Send + Sync>;

/// Bound required of every record type stored in a collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Record for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Wire format used for a collection's records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    /// Compact binary encoding via `bincode`.
    Bincode,
    /// Self-describing JSON via `serde_json`. Tolerates added optional fields.
    Json,
}

impl Format {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, String> {
        match self {
            Self::Bincode => bincode::serialize(value).map_err(|e| e.to_string()),
            Self::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, String> {
        match self {
            Self::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bincode => f.write_str("bincode"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Type-erased encoder/decoder for one collection.
pub(crate) trait ErasedCodec: Send + Sync {
    fn encode(&self, object: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, String>;
    fn decode(&self, bytes: &[u8]) -> Result<AnyObject, String>;
}

struct TypedCodec<T> {
    format: Format,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> ErasedCodec for TypedCodec<T> {
    fn encode(&self, object: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, String> {
        let value = object
            .downcast_ref::<T>()
            .ok_or_else(|| format!("object is not a {}", std::any::type_name::<T>()))?;
        self.format.encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnyObject, String> {
        let value: T = self.format.decode(bytes)?;
        Ok(Arc::new(value))
    }
}

/// Serializer registration for a single collection.
pub struct CollectionSchema {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    format: Format,
    codec: Box<dyn ErasedCodec>,
}

impl CollectionSchema {
    pub fn new<T: Record>(name: impl Into<String>, format: Format) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            format,
            codec: Box::new(TypedCodec::<T> {
                format,
                _marker: PhantomData,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Returns `true` if both schemas bind the same type with the same format.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.format == other.format
    }

    pub(crate) fn encode(&self, object: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, String> {
        self.codec.encode(object)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<AnyObject, String> {
        self.codec.decode(bytes)
    }
}

impl fmt::Debug for CollectionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSchema")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("format", &self.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        pinned: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    fn note() -> Note {
        Note {
            title: "groceries".into(),
            pinned: true,
        }
    }

    #[test]
    fn bincode_schema_decodes_what_it_encodes() {
        let schema = CollectionSchema::new::<Note>("notes", Format::Bincode);
        let bytes = schema.encode(&note()).unwrap();
        let decoded = schema.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Note>(), Some(&note()));
    }

    #[test]
    fn json_schema_writes_readable_json() {
        let schema = CollectionSchema::new::<Note>("notes", Format::Json);
        let bytes = schema.encode(&note()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"title\":\"groceries\""));
    }

    #[test]
    fn encode_rejects_foreign_type() {
        let schema = CollectionSchema::new::<Note>("notes", Format::Json);
        let err = schema.encode(&Counter { value: 1 }).unwrap_err();
        assert!(err.contains("Note"));
    }

    #[test]
    fn decode_rejects_incompatible_bytes() {
        let notes = CollectionSchema::new::<Note>("notes", Format::Json);
        let counters = CollectionSchema::new::<Counter>("counters", Format::Json);
        let bytes = counters.encode(&Counter { value: 7 }).unwrap();
        assert!(notes.decode(&bytes).is_err());
    }

    #[test]
    fn compatibility_requires_type_and_format() {
        let a = CollectionSchema::new::<Note>("notes", Format::Json);
        let b = CollectionSchema::new::<Note>("notes", Format::Json);
        let c = CollectionSchema::new::<Note>("notes", Format::Bincode);
        let d = CollectionSchema::new::<Counter>("notes", Format::Json);
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
        assert!(!a.is_compatible(&d));
    }

    #[test]
    fn shared_schema_reports_record_type() {
        let schema = std::sync::Arc::new(CollectionSchema::new::<Note>("notes", Format::Json));
        assert_eq!(schema.record_type_id(), TypeId::of::<Note>());
        assert_ne!(schema.record_type_id(), TypeId::of::<Counter>());
    }
}
