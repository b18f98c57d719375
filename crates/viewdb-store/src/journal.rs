use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::extension::RegistryEntry;

/// A single durable mutation inside a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    Set {
        collection: String,
        key: String,
        bytes: Vec<u8>,
    },
    Remove {
        collection: String,
        key: String,
    },
    RemoveAll {
        collection: String,
    },
    Register(RegistryEntry),
    Unregister {
        name: String,
    },
}

/// Everything one committed write transaction changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub seq: u64,
    pub ops: Vec<JournalOp>,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct JournalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Append-only commit journal.
///
/// On-disk format, one entry per commit:
/// ```text
/// [4 bytes: entry length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized CommitRecord)]
/// ```
///
/// Commits depend on their predecessors, so recovery stops at the first
/// entry that is truncated or fails its CRC.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    sync_mode: SyncMode,
}

impl Journal {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(JournalWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            sync_mode,
        })
    }

    /// Append one commit. Returns the byte offset of the entry.
    pub fn append(&self, record: &CommitRecord) -> StoreResult<u64> {
        let payload =
            bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let length = u32::try_from(payload.len())
            .map_err(|_| StoreError::Serialization("commit too large for journal".into()))?;
        let crc = crc32fast::hash(&payload);

        let mut w = self.writer.lock();
        let entry_offset = w.offset;

        w.writer.write_all(&length.to_le_bytes())?;
        w.writer.write_all(&crc.to_le_bytes())?;
        w.writer.write_all(&payload)?;
        w.writer.flush()?;
        if matches!(self.sync_mode, SyncMode::EveryCommit) {
            w.writer.get_ref().sync_data()?;
        }

        w.offset += HEADER_SIZE as u64 + payload.len() as u64;

        debug!(offset = entry_offset, seq = record.seq, len = payload.len(), "journal append");
        Ok(entry_offset)
    }

    /// Read back every intact commit, oldest first.
    pub fn recover(&self) -> StoreResult<Vec<CommitRecord>> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut records = Vec::new();
        let mut offset: u64 = 0;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
                warn!(offset, length, file_len, "torn journal entry; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            file.read_exact(&mut payload)?;

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "journal CRC mismatch; stopping recovery"
                );
                break;
            }

            match bincode::deserialize::<CommitRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(offset, error = %e, "undecodable journal entry; stopping recovery");
                    break;
                }
            }

            offset += HEADER_SIZE as u64 + length as u64;
        }

        debug!(recovered = records.len(), "journal recovery complete");
        Ok(records)
    }

    /// Drop every entry (after a checkpoint captured them).
    pub fn truncate(&self) -> StoreResult<()> {
        let mut w = self.writer.lock();
        w.writer.flush()?;

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = 0;

        debug!("journal truncated");
        Ok(())
    }

    /// Current size in bytes.
    pub fn offset(&self) -> u64 {
        self.writer.lock().offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("offset", &self.offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> CommitRecord {
        CommitRecord {
            seq,
            ops: vec![
                JournalOp::Set {
                    collection: "messages".into(),
                    key: format!("m{seq}"),
                    bytes: vec![seq as u8; 4],
                },
                JournalOp::Remove {
                    collection: "messages".into(),
                    key: "old".into(),
                },
            ],
        }
    }

    #[test]
    fn append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let journal = Journal::open(&path, SyncMode::default()).unwrap();

        journal.append(&record(1)).unwrap();
        journal.append(&record(2)).unwrap();

        let recovered = journal.recover().unwrap();
        assert_eq!(recovered, vec![record(1), record(2)]);
    }

    #[test]
    fn recover_empty_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(&dir.path().join("journal"), SyncMode::default()).unwrap();
        assert!(journal.recover().unwrap().is_empty());
        assert!(journal.is_empty());
    }

    #[test]
    fn reopen_appends_after_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        {
            let journal = Journal::open(&path, SyncMode::default()).unwrap();
            journal.append(&record(1)).unwrap();
        }
        let journal = Journal::open(&path, SyncMode::default()).unwrap();
        journal.append(&record(2)).unwrap();
        assert_eq!(journal.recover().unwrap().len(), 2);
    }

    #[test]
    fn corruption_stops_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let journal = Journal::open(&path, SyncMode::default()).unwrap();
        journal.append(&record(1)).unwrap();
        let second = journal.append(&record(2)).unwrap();
        journal.append(&record(3)).unwrap();
        drop(journal);

        // Flip the first payload byte of the second entry.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let at = second + HEADER_SIZE as u64;
            file.seek(SeekFrom::Start(at)).unwrap();
            let mut buf = [0u8; 1];
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xFF;
            file.seek(SeekFrom::Start(at)).unwrap();
            file.write_all(&buf).unwrap();
        }

        let journal = Journal::open(&path, SyncMode::default()).unwrap();
        let recovered = journal.recover().unwrap();
        assert_eq!(recovered, vec![record(1)]);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let journal = Journal::open(&path, SyncMode::default()).unwrap();
        journal.append(&record(1)).unwrap();
        journal.append(&record(2)).unwrap();
        let total = journal.offset();
        drop(journal);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(total - 3).unwrap();

        let journal = Journal::open(&path, SyncMode::default()).unwrap();
        assert_eq!(journal.recover().unwrap(), vec![record(1)]);
    }

    #[test]
    fn truncate_clears_entries() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(&dir.path().join("journal"), SyncMode::EveryCommit).unwrap();
        journal.append(&record(1)).unwrap();
        assert!(!journal.is_empty());

        journal.truncate().unwrap();
        assert!(journal.is_empty());
        assert!(journal.recover().unwrap().is_empty());

        journal.append(&record(5)).unwrap();
        assert_eq!(journal.recover().unwrap(), vec![record(5)]);
    }
}
