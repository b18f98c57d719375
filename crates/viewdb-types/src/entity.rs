use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identity of a record: the `{collection, key}` tuple.
///
/// Collections are disjoint namespaces, so a key is only unique within its
/// collection. Ordering is collection first, then key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    collection: String,
    key: String,
}

impl EntityId {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` if this entity lives in `collection`.
    pub fn is_in(&self, collection: &str) -> bool {
        self.collection == collection
    }

    /// Split into `(collection, key)`.
    pub fn into_parts(self) -> (String, String) {
        (self.collection, self.key)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}/{})", self.collection, self.key)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// Parses `collection/key`. The key may itself contain `/`; the collection
/// may not.
impl FromStr for EntityId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, key) = s
            .split_once('/')
            .ok_or_else(|| TypeError::InvalidEntityId(format!("missing '/' in {s:?}")))?;
        if collection.is_empty() {
            return Err(TypeError::InvalidEntityId(format!("empty collection in {s:?}")));
        }
        if key.is_empty() {
            return Err(TypeError::InvalidEntityId(format!("empty key in {s:?}")));
        }
        Ok(Self::new(collection, key))
    }
}

impl<C: Into<String>, K: Into<String>> From<(C, K)> for EntityId {
    fn from((collection, key): (C, K)) -> Self {
        Self::new(collection, key)
    }
}
