use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::changeset::{Changeset, ChangesetBuilder};
use crate::checkpoint::Checkpoint;
use crate::codec::{CollectionSchema, Format, Record};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::extension::{
    BuildContext, Extension, ExtensionSlot, ExtensionState, Registration, RegistryEntry, Upstream,
};
use crate::journal::{CommitRecord, Journal, JournalOp};
use crate::row::Row;
use crate::snapshot::Snapshot;
use crate::transaction::{ReadTransaction, WriteTransaction};

thread_local! {
    /// Databases with a write in progress on this thread.
    static ACTIVE_WRITERS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Holds the writer lock and marks this thread as writing.
struct WriterGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    id: usize,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        ACTIVE_WRITERS.with(|active| active.borrow_mut().retain(|&id| id != self.id));
    }
}

/// Registry and extension states recovered from disk, waiting for their
/// extensions to be registered again.
#[derive(Default)]
struct Persisted {
    registry: HashMap<String, RegistryEntry>,
    states: HashMap<String, Vec<u8>>,
    /// Persisted states are usable only while no data has changed since the
    /// checkpoint that produced them.
    layouts_valid: bool,
}

impl Persisted {
    /// Drop saved states of every extension derived from `name`, which was
    /// built fresh and no longer matches what they were derived from.
    fn forget_dependents(&mut self, name: &str) {
        let doomed: Vec<String> = self
            .registry
            .keys()
            .filter(|candidate| candidate.as_str() != name && self.derives_from(candidate, name))
            .cloned()
            .collect();
        for dependent in doomed {
            if self.states.remove(&dependent).is_some() {
                debug!(name = %dependent, parent = name, "dropping persisted state of dependent");
            }
        }
    }

    fn derives_from(&self, candidate: &str, ancestor: &str) -> bool {
        let mut current = candidate;
        for _ in 0..self.registry.len() {
            match self.registry.get(current).and_then(|entry| entry.parent.as_deref()) {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }
}

struct Inner {
    config: StoreConfig,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    journal: Option<Journal>,
    changes: broadcast::Sender<Arc<Changeset>>,
    persisted: Mutex<Persisted>,
    closed: AtomicBool,
}

/// An embedded collection/key/value object store.
///
/// Any number of concurrent readers each see a consistent committed
/// snapshot; writes are serialized through a single writer. Cloning a
/// `Database` yields another handle to the same store.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open a database. With no `path` configured the store lives in memory.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let mut snapshot = Snapshot::default();
        let mut persisted = Persisted {
            layouts_valid: true,
            ..Default::default()
        };

        let journal = match (config.journal_path(), config.checkpoint_path()) {
            (Some(journal_path), Some(checkpoint_path)) => {
                if let Some(checkpoint) = Checkpoint::load(&checkpoint_path)? {
                    load_checkpoint(&mut snapshot, &mut persisted, checkpoint);
                }
                let journal = Journal::open(&journal_path, config.sync_mode)?;
                let records = journal.recover()?;
                let replayed = records.len();
                for record in records {
                    replay(&mut snapshot, &mut persisted, record);
                }
                if !journal.is_empty() {
                    // Fold the tail into a fresh checkpoint so later appends
                    // never land behind a torn entry.
                    let checkpoint = checkpoint_of(&snapshot, &persisted);
                    checkpoint.write(&checkpoint_path)?;
                    journal.truncate()?;
                    debug!(replayed, "journal compacted on open");
                }
                Some(journal)
            }
            _ => None,
        };

        info!(
            path = ?config.path,
            seq = snapshot.seq(),
            collections = snapshot.collections().len(),
            layouts_valid = persisted.layouts_valid,
            "database opened"
        );

        let (changes, _) = broadcast::channel(config.channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                current: RwLock::new(Arc::new(snapshot)),
                writer: Mutex::new(()),
                journal,
                changes,
                persisted: Mutex::new(persisted),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open a purely in-memory database with default settings.
    pub fn in_memory() -> StoreResult<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Write a checkpoint, truncate the journal and refuse further use.
    pub fn close(&self) -> StoreResult<()> {
        let _guard = self.lock_writer()?;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.config.checkpoint_on_close {
            if let (Some(journal), Some(path)) =
                (&self.inner.journal, self.inner.config.checkpoint_path())
            {
                let snapshot = Arc::clone(&*self.inner.current.read());
                let checkpoint = checkpoint_of(&snapshot, &self.inner.persisted.lock());
                checkpoint.write(&path)?;
                journal.truncate()?;
            }
        }
        info!(seq = self.current_seq(), "database closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Bind `name` to record type `T` encoded with `format`.
    ///
    /// Registering the same type and format again is a no-op.
    pub fn register_collection<T: Record>(&self, name: &str, format: Format) -> StoreResult<()> {
        self.ensure_open()?;
        let _guard = self.lock_writer()?;
        let schema = CollectionSchema::new::<T>(name, format);

        let mut current = self.inner.current.write();
        if let Some(existing) = current.schema(name) {
            if existing.is_compatible(&schema) {
                return Ok(());
            }
            return Err(StoreError::CollectionConflict {
                collection: name.to_string(),
                existing: format!("{} ({})", existing.type_name(), existing.format()),
            });
        }
        let mut next = Snapshot::clone(&current);
        next.schemas.insert(name.to_string(), Arc::new(schema));
        *current = Arc::new(next);

        debug!(collection = name, format = %format, "collection registered");
        Ok(())
    }

    /// Start a read over the latest committed snapshot.
    pub fn begin_read(&self) -> StoreResult<ReadTransaction> {
        self.ensure_open()?;
        Ok(ReadTransaction::new(Arc::clone(&*self.inner.current.read())))
    }

    pub fn read<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&ReadTransaction) -> StoreResult<R>,
    {
        f(&self.begin_read()?)
    }

    /// Run `f` in a write transaction. Commits if `f` returns `Ok`; on `Err`
    /// nothing becomes visible.
    pub fn write<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut WriteTransaction) -> StoreResult<R>,
    {
        self.write_with_changes(f).map(|(value, _)| value)
    }

    /// Like [`write`](Self::write), also returning the commit's changeset.
    pub fn write_with_changes<R, F>(&self, f: F) -> StoreResult<(R, Arc<Changeset>)>
    where
        F: FnOnce(&mut WriteTransaction) -> StoreResult<R>,
    {
        self.ensure_open()?;
        let _guard = self.lock_writer()?;

        let base = Snapshot::clone(&self.inner.current.read());
        let mut txn = WriteTransaction::new(base, self.inner.config.max_hook_depth);

        let value = match f(&mut txn).and_then(|value| txn.run_commit_hooks().map(|()| value)) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "write transaction rolled back");
                return Err(e);
            }
        };

        let (snapshot, ops, changes) = txn.into_parts();
        let changeset = self.commit(snapshot, ops, changes)?;
        Ok((value, changeset))
    }

    fn commit(
        &self,
        mut snapshot: Snapshot,
        ops: Vec<JournalOp>,
        changes: ChangesetBuilder,
    ) -> StoreResult<Arc<Changeset>> {
        if ops.is_empty() && changes.is_empty() {
            return Ok(Arc::new(changes.finish(snapshot.seq)));
        }

        let seq = snapshot.seq + 1;
        if ops.iter().any(is_data_op) {
            self.inner.persisted.lock().layouts_valid = false;
        }
        if !ops.is_empty() {
            if let Some(journal) = &self.inner.journal {
                journal.append(&CommitRecord { seq, ops })?;
            }
        }

        snapshot.seq = seq;
        let changeset = Arc::new(changes.finish(seq));
        *self.inner.current.write() = Arc::new(snapshot);

        if !changeset.is_empty() {
            // No subscribers is fine.
            let _ = self.inner.changes.send(Arc::clone(&changeset));
        }
        debug!(seq, changes = changeset.len(), "commit");
        Ok(changeset)
    }

    /// Receive one [`Changeset`] per commit that changed anything.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Changeset>> {
        self.inner.changes.subscribe()
    }

    /// Sequence number of the latest commit.
    pub fn current_seq(&self) -> u64 {
        self.inner.current.read().seq()
    }

    /// Register an extension under `name`.
    ///
    /// - same kind and tag as the live registration: [`Registration::Unchanged`]
    /// - same tag as the persisted registration after a clean reopen:
    ///   [`Registration::Restored`]
    /// - a different tag: state rebuilt along with every dependent
    ///   extension, [`Registration::Rebuilt`]
    ///
    /// On failure the store is left as it was and the extension must not be
    /// queried.
    pub fn register<E: Extension>(&self, name: &str, extension: E) -> StoreResult<Registration> {
        self.register_shared(name, Arc::new(extension))
    }

    pub fn register_shared(
        &self,
        name: &str,
        extension: Arc<dyn Extension>,
    ) -> StoreResult<Registration> {
        self.ensure_open()?;
        let _guard = self.lock_writer()?;

        let base = Snapshot::clone(&self.inner.current.read());
        let (next, outcome) = match self.plan_registration(base, name, extension) {
            Ok(planned) => planned,
            Err(e) => {
                error!(name, error = %e, "extension registration failed");
                return Err(match e {
                    StoreError::ViewRegistrationFailed { .. } => e,
                    other => StoreError::ViewRegistrationFailed {
                        name: name.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        if matches!(outcome, Registration::Created | Registration::Rebuilt) {
            if let Some(journal) = &self.inner.journal {
                let index = next.slot_index(name).ok_or_else(|| {
                    StoreError::ExtensionNotFound(name.to_string())
                })?;
                let slot = &next.extensions[index];
                journal.append(&CommitRecord {
                    seq: next.seq,
                    ops: vec![JournalOp::Register(RegistryEntry::of(name, slot.extension.as_ref()))],
                })?;
            }
        }
        *self.inner.current.write() = Arc::new(next);

        let mut persisted = self.inner.persisted.lock();
        persisted.registry.remove(name);
        persisted.states.remove(name);
        drop(persisted);

        info!(name, outcome = ?outcome, "extension registered");
        Ok(outcome)
    }

    fn plan_registration(
        &self,
        mut snapshot: Snapshot,
        name: &str,
        extension: Arc<dyn Extension>,
    ) -> StoreResult<(Snapshot, Registration)> {
        let failed = |reason: String| StoreError::ViewRegistrationFailed {
            name: name.to_string(),
            reason,
        };

        if let Some(parent) = extension.parent() {
            if parent == name {
                return Err(failed("an extension cannot be its own parent".into()));
            }
            if snapshot.slot_index(parent).is_none() {
                return Err(failed(format!("parent {parent} is not registered")));
            }
        }

        if let Some(index) = snapshot.slot_index(name) {
            let live = &snapshot.extensions[index];
            if live.extension.kind() != extension.kind() {
                return Err(failed(format!(
                    "already registered as {}",
                    live.extension.kind()
                )));
            }
            if live.extension.version_tag() == extension.version_tag() {
                snapshot.extensions[index].extension = extension;
                return Ok((snapshot, Registration::Unchanged));
            }

            debug!(
                name,
                from = live.extension.version_tag(),
                to = extension.version_tag(),
                "version tag changed; rebuilding"
            );
            snapshot.extensions[index].extension = extension;
            let state = build_slot(&snapshot, index)?;
            snapshot.extensions[index].state = state;
            rebuild_dependents(&mut snapshot, index)?;
            self.inner.persisted.lock().forget_dependents(name);
            return Ok((snapshot, Registration::Rebuilt));
        }

        let (prior, saved, layouts_valid) = {
            let persisted = self.inner.persisted.lock();
            (
                persisted.registry.get(name).cloned(),
                persisted.states.get(name).cloned(),
                persisted.layouts_valid,
            )
        };

        let index = snapshot.extensions.len();
        let mut restored = None;
        if let (Some(entry), Some(bytes), true) = (&prior, &saved, layouts_valid) {
            if entry.matches(extension.as_ref()) {
                let ctx = BuildContext::new(&snapshot, Upstream::new(&snapshot.extensions));
                match extension.restore(&ctx, bytes) {
                    Ok(state) => restored = state,
                    Err(e) => warn!(name, error = %e, "persisted state unusable; rebuilding"),
                }
            }
        }

        let outcome = match restored {
            Some(state) => {
                snapshot.extensions.push(ExtensionSlot {
                    name: name.to_string(),
                    extension,
                    state,
                });
                Registration::Restored
            }
            None => {
                let rebuilt = prior
                    .as_ref()
                    .is_some_and(|entry| !entry.matches(extension.as_ref()));
                let state = {
                    let ctx = BuildContext::new(&snapshot, Upstream::new(&snapshot.extensions));
                    extension.build(&ctx)?
                };
                snapshot.extensions.push(ExtensionSlot {
                    name: name.to_string(),
                    extension,
                    state,
                });
                self.inner.persisted.lock().forget_dependents(name);
                if rebuilt {
                    Registration::Rebuilt
                } else {
                    Registration::Created
                }
            }
        };
        debug_assert_eq!(snapshot.slot_index(name), Some(index));
        Ok((snapshot, outcome))
    }

    /// Register on a blocking task and report success through `on_complete`.
    ///
    /// Queries against `name` should wait for the callback.
    pub fn async_register<E, F>(
        &self,
        name: impl Into<String>,
        extension: E,
        on_complete: F,
    ) -> JoinHandle<StoreResult<Registration>>
    where
        E: Extension,
        F: FnOnce(bool) + Send + 'static,
    {
        let db = self.clone();
        let name = name.into();
        tokio::task::spawn_blocking(move || {
            let result = db.register(&name, extension);
            on_complete(result.is_ok());
            result
        })
    }

    /// Remove an extension and every extension derived from it.
    /// Returns `false` if `name` was not registered.
    pub fn unregister(&self, name: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        let _guard = self.lock_writer()?;

        let mut next = Snapshot::clone(&self.inner.current.read());
        let Some(index) = next.slot_index(name) else {
            return Ok(false);
        };

        let mut doomed: HashSet<String> = HashSet::from([name.to_string()]);
        for slot in &next.extensions[index + 1..] {
            if slot.extension.parent().is_some_and(|p| doomed.contains(p)) {
                doomed.insert(slot.name.clone());
            }
        }
        next.extensions.retain(|slot| !doomed.contains(&slot.name));

        if let Some(journal) = &self.inner.journal {
            let mut names: Vec<&String> = doomed.iter().collect();
            names.sort();
            let ops = names
                .into_iter()
                .map(|name| JournalOp::Unregister { name: name.clone() })
                .collect();
            journal.append(&CommitRecord { seq: next.seq, ops })?;
        }
        *self.inner.current.write() = Arc::new(next);

        info!(name, removed = doomed.len(), "extension unregistered");
        Ok(true)
    }

    /// Live registrations, in registration order.
    pub fn registered_extensions(&self) -> Vec<RegistryEntry> {
        self.inner
            .current
            .read()
            .extensions
            .iter()
            .map(|slot| RegistryEntry::of(&slot.name, slot.extension.as_ref()))
            .collect()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn lock_writer(&self) -> StoreResult<WriterGuard<'_>> {
        let id = Arc::as_ptr(&self.inner) as usize;
        if ACTIVE_WRITERS.with(|active| active.borrow().contains(&id)) {
            return Err(StoreError::WriteConflict(
                "a write transaction is already open on this thread".into(),
            ));
        }
        let lock = self.inner.writer.lock();
        ACTIVE_WRITERS.with(|active| active.borrow_mut().push(id));
        Ok(WriterGuard { _lock: lock, id })
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.config.path)
            .field("seq", &self.current_seq())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn is_data_op(op: &JournalOp) -> bool {
    matches!(
        op,
        JournalOp::Set { .. } | JournalOp::Remove { .. } | JournalOp::RemoveAll { .. }
    )
}

fn build_slot(snapshot: &Snapshot, index: usize) -> StoreResult<Box<dyn ExtensionState>> {
    let ctx = BuildContext::new(snapshot, Upstream::new(&snapshot.extensions[..index]));
    snapshot.extensions[index].extension.build(&ctx)
}

/// Rebuild every extension that derives (transitively) from the one at `index`.
fn rebuild_dependents(snapshot: &mut Snapshot, index: usize) -> StoreResult<()> {
    let mut changed: HashSet<String> = HashSet::from([snapshot.extensions[index].name.clone()]);
    for i in index + 1..snapshot.extensions.len() {
        let depends = snapshot.extensions[i]
            .extension
            .parent()
            .is_some_and(|parent| changed.contains(parent));
        if depends {
            let state = build_slot(snapshot, i)?;
            snapshot.extensions[i].state = state;
            changed.insert(snapshot.extensions[i].name.clone());
            debug!(name = %snapshot.extensions[i].name, "dependent rebuilt");
        }
    }
    Ok(())
}

fn load_checkpoint(snapshot: &mut Snapshot, persisted: &mut Persisted, checkpoint: Checkpoint) {
    snapshot.seq = checkpoint.seq;
    for (collection, rows) in checkpoint.collections {
        let rows = rows
            .into_iter()
            .map(|(key, bytes)| (key, Arc::new(Row::from_bytes(bytes))))
            .collect();
        snapshot.rows.insert(collection, rows);
    }
    persisted.registry = checkpoint
        .registry
        .into_iter()
        .map(|entry| (entry.name.clone(), entry))
        .collect();
    persisted.states = checkpoint.states.into_iter().collect();
}

fn replay(snapshot: &mut Snapshot, persisted: &mut Persisted, record: CommitRecord) {
    snapshot.seq = snapshot.seq.max(record.seq);
    for op in record.ops {
        if is_data_op(&op) {
            persisted.layouts_valid = false;
        }
        match op {
            JournalOp::Set {
                collection,
                key,
                bytes,
            } => {
                let mut rows = snapshot.rows.get(&collection).cloned().unwrap_or_default();
                rows.insert(key, Arc::new(Row::from_bytes(bytes)));
                snapshot.rows.insert(collection, rows);
            }
            JournalOp::Remove { collection, key } => {
                if let Some(mut rows) = snapshot.rows.get(&collection).cloned() {
                    rows.remove(&key);
                    snapshot.rows.insert(collection, rows);
                }
            }
            JournalOp::RemoveAll { collection } => {
                snapshot.rows.remove(&collection);
            }
            JournalOp::Register(entry) => {
                persisted.states.remove(&entry.name);
                persisted.registry.insert(entry.name.clone(), entry);
            }
            JournalOp::Unregister { name } => {
                persisted.states.remove(&name);
                persisted.registry.remove(&name);
            }
        }
    }
}

/// Image of `snapshot` plus any persisted registrations not yet re-registered.
fn checkpoint_of(snapshot: &Snapshot, persisted: &Persisted) -> Checkpoint {
    let collections = snapshot
        .rows
        .iter()
        .filter(|(_, rows)| !rows.is_empty())
        .map(|(collection, rows)| {
            let rows: BTreeMap<String, Vec<u8>> = rows
                .iter()
                .map(|(key, row)| (key.clone(), row.bytes().to_vec()))
                .collect();
            (collection.clone(), rows)
        })
        .collect();

    let mut registry = Vec::new();
    let mut states = BTreeMap::new();
    for slot in &snapshot.extensions {
        registry.push(RegistryEntry::of(&slot.name, slot.extension.as_ref()));
        match slot.state.persist() {
            Ok(Some(bytes)) => {
                states.insert(slot.name.clone(), bytes);
            }
            Ok(None) => {}
            Err(e) => warn!(name = %slot.name, error = %e, "extension state not persisted"),
        }
    }

    let mut pending: Vec<&RegistryEntry> = persisted
        .registry
        .values()
        .filter(|entry| snapshot.slot_index(&entry.name).is_none())
        .collect();
    pending.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in pending {
        registry.push(entry.clone());
        if persisted.layouts_valid {
            if let Some(bytes) = persisted.states.get(&entry.name) {
                states.insert(entry.name.clone(), bytes.clone());
            }
        }
    }

    Checkpoint {
        seq: snapshot.seq,
        collections,
        registry,
        states,
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::changeset::ChangeKind;
    use crate::codec::AnyObject;
    use crate::extension::RowChange;
    use crate::hooks::RowHooks;
    use crate::transaction::Reader;
    use viewdb_types::EntityId;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn note(text: &str) -> Note {
        Note { text: text.into() }
    }

    fn notes_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        db
    }

    // --- Test extension: tracks the set of keys in "notes" ---

    #[derive(Clone)]
    struct KeySet {
        keys: im::OrdSet<String>,
    }

    impl ExtensionState for KeySet {
        fn clone_state(&self) -> Box<dyn ExtensionState> {
            Box::new(self.clone())
        }

        fn apply(&mut self, change: &RowChange<'_>, _upstream: &Upstream<'_>) -> StoreResult<()> {
            if change.collection() != "notes" {
                return Ok(());
            }
            match change {
                RowChange::Upsert { id, .. } => {
                    self.keys.insert(id.key().to_string());
                }
                RowChange::Remove { id } => {
                    self.keys.remove(id.key());
                }
                RowChange::RemoveAll { .. } => self.keys = im::OrdSet::new(),
            }
            Ok(())
        }

        fn persist(&self) -> StoreResult<Option<Vec<u8>>> {
            let keys: Vec<String> = self.keys.iter().cloned().collect();
            serde_json::to_vec(&keys)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string()))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct KeyIndex {
        tag: &'static str,
        parent: Option<&'static str>,
    }

    impl KeyIndex {
        fn tagged(tag: &'static str) -> Self {
            Self { tag, parent: None }
        }
    }

    impl Extension for KeyIndex {
        fn kind(&self) -> &'static str {
            "key-index"
        }

        fn version_tag(&self) -> &str {
            self.tag
        }

        fn parent(&self) -> Option<&str> {
            self.parent
        }

        fn build(&self, ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>> {
            Ok(Box::new(KeySet {
                keys: ctx.snapshot().keys("notes").into_iter().collect(),
            }))
        }

        fn restore(
            &self,
            _ctx: &BuildContext<'_>,
            persisted: &[u8],
        ) -> StoreResult<Option<Box<dyn ExtensionState>>> {
            let keys: Vec<String> = match serde_json::from_slice(persisted) {
                Ok(keys) => keys,
                Err(_) => return Ok(None),
            };
            Ok(Some(Box::new(KeySet {
                keys: keys.into_iter().collect(),
            })))
        }
    }

    fn indexed_keys(db: &Database, name: &str) -> Vec<String> {
        db.read(|txn| {
            Ok(txn
                .ext::<KeySet>(name)
                .map(|s| s.keys.iter().cloned().collect())
                .unwrap_or_default())
        })
        .unwrap()
    }

    // --- Test hooks: mirror writes to "notes" into "audit" ---

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Audit {
        source: String,
    }

    struct Mirror {
        /// Also write from hooks fired by "audit" writes (must be rejected).
        chain: bool,
        /// Discard the result of the chained write.
        swallow: bool,
    }

    impl RowHooks for Mirror {
        fn did_modify(
            &self,
            txn: &mut WriteTransaction,
            collection: &str,
            key: &str,
            _object: &AnyObject,
        ) -> StoreResult<()> {
            match collection {
                "notes" => txn.set("audit", key, Audit { source: key.to_string() }),
                "audit" if self.chain && self.swallow => {
                    let _ = txn.set("notes", "echo", note("echo"));
                    Ok(())
                }
                "audit" if self.chain => txn.set("notes", "echo", note("echo")),
                _ => Ok(()),
            }
        }

        fn will_remove(&self, txn: &mut WriteTransaction, collection: &str, key: &str) -> StoreResult<()> {
            if collection == "notes" {
                txn.remove("audit", key)?;
            }
            Ok(())
        }
    }

    impl Extension for Mirror {
        fn kind(&self) -> &'static str {
            "hooks"
        }

        fn version_tag(&self) -> &str {
            ""
        }

        fn build(&self, _ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>> {
            Ok(Box::new(crate::extension::StatelessState))
        }

        fn hooks(&self) -> Option<&dyn RowHooks> {
            Some(self)
        }
    }

    fn mirrored_db(chain: bool) -> Database {
        mirrored_db_with(Mirror { chain, swallow: false })
    }

    fn mirrored_db_with(mirror: Mirror) -> Database {
        let db = notes_db();
        db.register_collection::<Audit>("audit", Format::Bincode).unwrap();
        db.register("mirror", mirror).unwrap();
        db
    }

    // --- Reads and writes ---

    #[test]
    fn set_then_get() {
        let db = notes_db();
        db.write(|txn| txn.set("notes", "a", note("hello"))).unwrap();

        let got = db.read(|txn| txn.get::<Note>("notes", "a")).unwrap();
        assert_eq!(got.as_deref(), Some(&note("hello")));
        assert!(db.read(|txn| txn.get::<Note>("notes", "zz")).unwrap().is_none());
        assert_eq!(db.current_seq(), 1);
    }

    #[test]
    fn get_with_wrong_type_is_mismatch() {
        let db = notes_db();
        db.write(|txn| txn.set("notes", "a", note("hello"))).unwrap();
        let err = db.read(|txn| txn.get::<Audit>("notes", "a")).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn set_with_wrong_type_is_mismatch() {
        let db = notes_db();
        let err = db
            .write(|txn| txn.set("notes", "a", Audit { source: "x".into() }))
            .unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_collection() {
        let db = notes_db();
        let err = db.write(|txn| txn.set("ghosts", "a", note("boo"))).unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection(_)));
    }

    #[test]
    fn collection_registration() {
        let db = notes_db();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        let err = db
            .register_collection::<Note>("notes", Format::Bincode)
            .unwrap_err();
        assert!(matches!(err, StoreError::CollectionConflict { .. }));
    }

    #[test]
    fn failed_write_rolls_back() {
        let db = notes_db();
        let result: StoreResult<()> = db.write(|txn| {
            txn.set("notes", "a", note("one"))?;
            Err(StoreError::Aborted("changed my mind".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.read(|txn| Ok(txn.count("notes"))).unwrap(), 0);
        assert_eq!(db.current_seq(), 0);
    }

    #[test]
    fn rejected_write_leaves_transaction_usable() {
        let db = notes_db();
        db.write(|txn| {
            txn.set("notes", "a", note("one"))?;
            assert!(txn.set("ghosts", "g", note("lost")).is_err());
            Ok(())
        })
        .unwrap();
        assert_eq!(db.read(|txn| Ok(txn.count("notes"))).unwrap(), 1);
    }

    #[test]
    fn nested_write_is_conflict() {
        let db = notes_db();
        let inner = db.clone();
        let err = db
            .write(|_txn| inner.write(|txn| txn.set("notes", "a", note("x"))))
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(_)));
        // The writer is usable again afterwards.
        db.write(|txn| txn.set("notes", "a", note("x"))).unwrap();
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let db = notes_db();
        db.write(|txn| txn.set("notes", "a", note("v1"))).unwrap();
        let before = db.begin_read().unwrap();
        db.write(|txn| txn.set("notes", "a", note("v2"))).unwrap();

        assert_eq!(before.get::<Note>("notes", "a").unwrap().unwrap().text, "v1");
        let after = db.begin_read().unwrap();
        assert_eq!(after.get::<Note>("notes", "a").unwrap().unwrap().text, "v2");
        assert_eq!(after.seq(), before.seq() + 1);
    }

    #[test]
    fn remove_and_remove_all() {
        let db = notes_db();
        db.write(|txn| {
            txn.set("notes", "a", note("1"))?;
            txn.set("notes", "b", note("2"))?;
            txn.set("notes", "c", note("3"))
        })
        .unwrap();

        assert!(db.write(|txn| txn.remove("notes", "a")).unwrap());
        assert!(!db.write(|txn| txn.remove("notes", "a")).unwrap());
        assert_eq!(db.write(|txn| txn.remove_all("notes")).unwrap(), 2);
        assert!(db.read(|txn| Ok(txn.keys("notes"))).unwrap().is_empty());
    }

    // --- Changesets ---

    #[tokio::test]
    async fn subscribers_receive_changesets() {
        let db = notes_db();
        let mut rx = db.subscribe();

        db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
        db.write(|txn| {
            txn.set("notes", "a", note("2"))?;
            txn.touch("notes", "a");
            Ok(())
        })
        .unwrap();
        db.write(|txn| txn.remove("notes", "a")).unwrap();

        let id = EntityId::new("notes", "a");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind_of(&id), Some(ChangeKind::Inserted));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind_of(&id), Some(ChangeKind::Updated));
        assert_eq!(second.len(), 1);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.kind_of(&id), Some(ChangeKind::Removed));
        assert_eq!(third.seq(), 3);
    }

    #[tokio::test]
    async fn short_lived_row_is_not_broadcast() {
        let db = notes_db();
        let mut rx = db.subscribe();
        let ((), changes) = db
            .write_with_changes(|txn| {
                txn.set("notes", "tmp", note("gone"))?;
                txn.remove("notes", "tmp").map(|_| ())
            })
            .unwrap();
        assert!(changes.is_empty());
        assert!(rx.try_recv().is_err());
        assert!(!db.read(|txn| Ok(txn.has("notes", "tmp"))).unwrap());
    }

    #[test]
    fn empty_write_changes_nothing() {
        let db = notes_db();
        let mut rx = db.subscribe();
        let ((), changes) = db.write_with_changes(|_txn| Ok(())).unwrap();
        assert!(changes.is_empty());
        assert_eq!(db.current_seq(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn touch_only_commit_is_reported() {
        let db = notes_db();
        db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
        let (touched, changes) = db
            .write_with_changes(|txn| Ok(txn.touch("notes", "a") && !txn.touch("notes", "nope")))
            .unwrap();
        assert!(touched);
        assert_eq!(
            changes.kind_of(&EntityId::new("notes", "a")),
            Some(ChangeKind::Touched)
        );
    }

    // --- Extensions ---

    #[test]
    fn extension_tracks_writes() {
        let db = notes_db();
        db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("1")).unwrap(), Registration::Created);
        db.write(|txn| txn.set("notes", "b", note("2"))).unwrap();
        assert_eq!(indexed_keys(&db, "keys"), vec!["a", "b"]);

        db.write(|txn| txn.remove("notes", "a")).unwrap();
        assert_eq!(indexed_keys(&db, "keys"), vec!["b"]);
    }

    #[test]
    fn reregistration_outcomes() {
        let db = notes_db();
        db.register("keys", KeyIndex::tagged("1")).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("1")).unwrap(), Registration::Unchanged);
        assert_eq!(db.register("keys", KeyIndex::tagged("2")).unwrap(), Registration::Rebuilt);
        assert_eq!(db.registered_extensions()[0].tag, "2");

        let err = db
            .register("keys", Mirror { chain: false, swallow: false })
            .unwrap_err();
        assert!(matches!(err, StoreError::ViewRegistrationFailed { .. }));
    }

    #[test]
    fn missing_parent_fails() {
        let db = notes_db();
        let err = db
            .register(
                "child",
                KeyIndex {
                    tag: "1",
                    parent: Some("absent"),
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ViewRegistrationFailed { .. }));
        assert!(db.registered_extensions().is_empty());
    }

    #[test]
    fn unregister_removes_dependents() {
        let db = notes_db();
        db.register("keys", KeyIndex::tagged("1")).unwrap();
        db.register(
            "child",
            KeyIndex {
                tag: "1",
                parent: Some("keys"),
            },
        )
        .unwrap();
        assert!(db.unregister("keys").unwrap());
        assert!(db.registered_extensions().is_empty());
        assert!(!db.unregister("keys").unwrap());
    }

    #[tokio::test]
    async fn async_register_reports_completion() {
        let db = notes_db();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = db.async_register("keys", KeyIndex::tagged("1"), move |ok| {
            let _ = tx.send(ok);
        });
        assert!(rx.await.unwrap());
        assert_eq!(handle.await.unwrap().unwrap(), Registration::Created);
    }

    // --- Hooks ---

    #[test]
    fn hook_writes_join_the_transaction() {
        let db = mirrored_db(false);
        let (_, changes) = db
            .write_with_changes(|txn| txn.set("notes", "a", note("1")))
            .unwrap();
        assert!(changes.contains(&EntityId::new("audit", "a")));
        assert!(db.read(|txn| Ok(txn.has("audit", "a"))).unwrap());

        db.write(|txn| txn.remove("notes", "a")).unwrap();
        assert!(!db.read(|txn| Ok(txn.has("audit", "a"))).unwrap());
    }

    #[test]
    fn second_hop_is_rejected() {
        let db = mirrored_db(true);
        let err = db.write(|txn| txn.set("notes", "a", note("1"))).unwrap_err();
        assert!(matches!(err, StoreError::HookCascade { .. }));
        assert_eq!(db.read(|txn| Ok(txn.count("notes"))).unwrap(), 0);
        assert_eq!(db.read(|txn| Ok(txn.count("audit"))).unwrap(), 0);
    }

    #[test]
    fn swallowed_hook_failure_aborts_commit() {
        let db = mirrored_db(true);
        let result = db.write(|txn| {
            let _ = txn.set("notes", "a", note("1"));
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert_eq!(db.read(|txn| Ok(txn.count("notes"))).unwrap(), 0);
    }

    #[test]
    fn cascade_discarded_by_hook_aborts_commit() {
        let db = mirrored_db_with(Mirror { chain: true, swallow: true });
        let result = db.write(|txn| txn.set("notes", "a", note("1")));
        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert_eq!(db.read(|txn| Ok(txn.count("notes"))).unwrap(), 0);
        assert_eq!(db.read(|txn| Ok(txn.count("audit"))).unwrap(), 0);
        assert_eq!(db.current_seq(), 0);
    }

    // --- Persistence ---

    #[test]
    fn reopen_after_close() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            db.write(|txn| txn.set("notes", "a", note("kept"))).unwrap();
            db.close().unwrap();
            assert!(matches!(db.begin_read(), Err(StoreError::Closed)));
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        let got = db.read(|txn| txn.get::<Note>("notes", "a")).unwrap();
        assert_eq!(got.unwrap().text, "kept");
    }

    #[test]
    fn reopen_replays_journal_without_close() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Bincode).unwrap();
            db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
            db.write(|txn| txn.set("notes", "b", note("2"))).unwrap();
            db.write(|txn| txn.remove("notes", "a")).unwrap();
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Bincode).unwrap();
        assert_eq!(db.read(|txn| Ok(txn.keys("notes"))).unwrap(), vec!["b"]);
        assert_eq!(db.current_seq(), 3);
    }

    #[test]
    fn persisted_state_restored_after_clean_close() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            db.register("keys", KeyIndex::tagged("1")).unwrap();
            db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("1")).unwrap(), Registration::Restored);
        assert_eq!(indexed_keys(&db, "keys"), vec!["a"]);
    }

    #[test]
    fn tag_change_across_reopen_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            db.register("keys", KeyIndex::tagged("1")).unwrap();
            db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("2")).unwrap(), Registration::Rebuilt);
        assert_eq!(indexed_keys(&db, "keys"), vec!["a"]);
    }

    #[test]
    fn unclean_shutdown_forces_build() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            db.register("keys", KeyIndex::tagged("1")).unwrap();
            db.close().unwrap();
        }
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            // Written before the index is registered again, then no close.
            db.write(|txn| txn.set("notes", "late", note("x"))).unwrap();
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("1")).unwrap(), Registration::Created);
        assert_eq!(indexed_keys(&db, "keys"), vec!["late"]);
    }

    #[test]
    fn parent_rebuild_across_reopen_rebuilds_dependents() {
        let child = || KeyIndex {
            tag: "1",
            parent: Some("keys"),
        };
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            db.register("keys", KeyIndex::tagged("1")).unwrap();
            db.register("child", child()).unwrap();
            db.write(|txn| txn.set("notes", "a", note("1"))).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("2")).unwrap(), Registration::Rebuilt);
        assert_eq!(db.register("child", child()).unwrap(), Registration::Created);
        assert_eq!(indexed_keys(&db, "child"), vec!["a"]);
    }

    #[test]
    fn restored_parent_keeps_dependents_restorable() {
        let child = || KeyIndex {
            tag: "1",
            parent: Some("keys"),
        };
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(StoreConfig::at(dir.path())).unwrap();
            db.register_collection::<Note>("notes", Format::Json).unwrap();
            db.register("keys", KeyIndex::tagged("1")).unwrap();
            db.register("child", child()).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(StoreConfig::at(dir.path())).unwrap();
        db.register_collection::<Note>("notes", Format::Json).unwrap();
        assert_eq!(db.register("keys", KeyIndex::tagged("1")).unwrap(), Registration::Restored);
        assert_eq!(db.register("child", child()).unwrap(), Registration::Restored);
    }
}
