use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::extension::RegistryEntry;

/// Full image of the database written on close.
///
/// On-disk format: `[4 bytes: CRC32 of payload (LE)] [payload (bincode)]`.
/// Written to a temporary file and renamed into place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub(crate) seq: u64,
    pub(crate) collections: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    pub(crate) registry: Vec<RegistryEntry>,
    /// Persisted extension states, by extension name.
    pub(crate) states: BTreeMap<String, Vec<u8>>,
}

impl Checkpoint {
    /// Load the checkpoint at `path`; `Ok(None)` if there is none yet.
    pub(crate) fn load(path: &Path) -> StoreResult<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() < 4 {
            return Err(StoreError::Serialization("checkpoint file too short".into()));
        }
        let (header, payload) = data.split_at(4);
        let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if crc32fast::hash(payload) != expected {
            return Err(StoreError::Serialization("checkpoint CRC mismatch".into()));
        }
        let checkpoint =
            bincode::deserialize(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(checkpoint))
    }

    pub(crate) fn write(&self, path: &Path) -> StoreResult<()> {
        let payload =
            bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(seq = self.seq, bytes = payload.len(), "checkpoint written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut rows = BTreeMap::new();
        rows.insert("alice".to_string(), vec![1, 2, 3]);
        let mut collections = BTreeMap::new();
        collections.insert("conversations".to_string(), rows);
        Checkpoint {
            seq: 9,
            collections,
            registry: vec![RegistryEntry {
                name: "ConversationsView".into(),
                kind: "view".into(),
                tag: "1".into(),
                parent: None,
            }],
            states: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("none.bin")).unwrap().is_none());
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        sample().write(&path).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), Some(sample()));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_checkpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        sample().write(&path).unwrap();
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
