//! Read and write transactions.
//!
//! A write transaction follows a strict order for every row mutation:
//! `will_*` hooks → row stored/removed → extension states updated (in
//! registration order) → `did_*` hooks. All of it lands in one atomic
//! commit, or in none if the transaction fails.

use std::any::Any;
use std::sync::Arc;

use tracing::error;
use viewdb_types::EntityId;

use crate::changeset::{ChangeKind, ChangesetBuilder};
use crate::codec::{AnyObject, Record};
use crate::error::{StoreError, StoreResult};
use crate::extension::{Extension, ExtensionState, RowChange, Upstream};
use crate::hooks::RowHooks;
use crate::journal::JournalOp;
use crate::row::Row;
use crate::snapshot::Snapshot;

/// Read access shared by snapshots and both transaction kinds.
pub trait Reader {
    fn snapshot(&self) -> &Snapshot;

    /// Typed read; `Ok(None)` if the key is absent.
    fn get<T: Any + Send + Sync>(&self, collection: &str, key: &str) -> StoreResult<Option<Arc<T>>> {
        self.snapshot().get(collection, key)
    }

    fn object(&self, collection: &str, key: &str) -> StoreResult<Option<AnyObject>> {
        self.snapshot().object(collection, key)
    }

    fn has(&self, collection: &str, key: &str) -> bool {
        self.snapshot().has(collection, key)
    }

    fn keys(&self, collection: &str) -> Vec<String> {
        self.snapshot().keys(collection)
    }

    fn count(&self, collection: &str) -> usize {
        self.snapshot().count(collection)
    }

    fn collections(&self) -> Vec<String> {
        self.snapshot().collections()
    }

    fn extension_state(&self, name: &str) -> Option<&dyn ExtensionState> {
        self.snapshot().extension_state(name)
    }

    /// Typed access to an extension's state.
    fn ext<S: 'static>(&self, name: &str) -> Option<&S> {
        self.extension_state(name)
            .and_then(|state| state.as_any().downcast_ref::<S>())
    }
}

impl Reader for Snapshot {
    fn snapshot(&self) -> &Snapshot {
        self
    }
}

/// A consistent read over one committed snapshot. Never blocks writers.
#[derive(Clone, Debug)]
pub struct ReadTransaction {
    snapshot: Arc<Snapshot>,
}

impl ReadTransaction {
    pub(crate) fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }

    pub fn seq(&self) -> u64 {
        self.snapshot.seq()
    }
}

impl Reader for ReadTransaction {
    fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// Label pushed on the hook stack while `will_commit` hooks run.
const COMMIT_SCOPE: &str = "";

/// The single writer's private working copy.
pub struct WriteTransaction {
    snapshot: Snapshot,
    changes: ChangesetBuilder,
    ops: Vec<JournalOp>,
    /// Collections whose hooks are currently executing, outermost first.
    hook_stack: Vec<String>,
    max_hook_depth: usize,
    poisoned: Option<String>,
}

impl WriteTransaction {
    pub(crate) fn new(snapshot: Snapshot, max_hook_depth: usize) -> Self {
        Self {
            snapshot,
            changes: ChangesetBuilder::new(),
            ops: Vec::new(),
            hook_stack: Vec::new(),
            max_hook_depth,
            poisoned: None,
        }
    }

    /// Insert or replace a record.
    pub fn set<T: Record>(&mut self, collection: &str, key: &str, value: T) -> StoreResult<()> {
        let object: AnyObject = Arc::new(value);
        self.set_object(collection, key, object)
    }

    /// Insert or replace a record from an already shared value.
    pub fn set_shared<T: Record>(&mut self, collection: &str, key: &str, value: Arc<T>) -> StoreResult<()> {
        let object: AnyObject = value;
        self.set_object(collection, key, object)
    }

    fn set_object(&mut self, collection: &str, key: &str, object: AnyObject) -> StoreResult<()> {
        self.check_cascade(collection, key)?;
        let schema = Arc::clone(
            self.snapshot
                .schema(collection)
                .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?,
        );
        let bytes = schema
            .encode(&*object)
            .map_err(|reason| StoreError::type_mismatch(collection, key, reason))?;

        let result = self.apply_set(collection, key, object, bytes);
        self.poison_on_error(result)
    }

    fn apply_set(
        &mut self,
        collection: &str,
        key: &str,
        object: AnyObject,
        bytes: Vec<u8>,
    ) -> StoreResult<()> {
        let existed = self.snapshot.has(collection, key);
        self.dispatch(collection, |hooks, txn| hooks.will_modify(txn, collection, key, &object))?;

        let id = EntityId::new(collection, key);
        let mut rows = self.snapshot.rows.get(collection).cloned().unwrap_or_default();
        rows.insert(key.to_string(), Arc::new(Row::with_object(bytes.clone(), Arc::clone(&object))));
        self.snapshot.rows.insert(collection.to_string(), rows);
        self.apply_extensions(&RowChange::Upsert { id: &id, object: &object })?;

        let kind = if existed { ChangeKind::Updated } else { ChangeKind::Inserted };
        self.changes.record(id, kind);
        self.ops.push(JournalOp::Set {
            collection: collection.to_string(),
            key: key.to_string(),
            bytes,
        });

        self.dispatch(collection, |hooks, txn| hooks.did_modify(txn, collection, key, &object))
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub fn remove(&mut self, collection: &str, key: &str) -> StoreResult<bool> {
        self.check_cascade(collection, key)?;
        if !self.snapshot.has(collection, key) {
            return Ok(false);
        }
        let result = self.apply_remove(collection, key);
        self.poison_on_error(result).map(|()| true)
    }

    fn apply_remove(&mut self, collection: &str, key: &str) -> StoreResult<()> {
        self.dispatch(collection, |hooks, txn| hooks.will_remove(txn, collection, key))?;

        let id = EntityId::new(collection, key);
        if let Some(mut rows) = self.snapshot.rows.get(collection).cloned() {
            rows.remove(key);
            self.snapshot.rows.insert(collection.to_string(), rows);
        }
        self.apply_extensions(&RowChange::Remove { id: &id })?;

        self.changes.record(id, ChangeKind::Removed);
        self.ops.push(JournalOp::Remove {
            collection: collection.to_string(),
            key: key.to_string(),
        });

        self.dispatch(collection, |hooks, txn| hooks.did_remove(txn, collection, key))
    }

    /// Remove every record in a collection. Returns how many were removed.
    pub fn remove_all(&mut self, collection: &str) -> StoreResult<usize> {
        self.check_cascade(collection, "*")?;
        let keys = self.snapshot.keys(collection);
        if keys.is_empty() {
            return Ok(0);
        }
        let result = self.apply_remove_all(collection, &keys);
        self.poison_on_error(result).map(|()| keys.len())
    }

    fn apply_remove_all(&mut self, collection: &str, keys: &[String]) -> StoreResult<()> {
        self.dispatch(collection, |hooks, txn| hooks.will_remove_all(txn, collection))?;

        self.snapshot.rows.remove(collection);
        self.apply_extensions(&RowChange::RemoveAll { collection })?;

        for key in keys {
            self.changes
                .record(EntityId::new(collection, key.as_str()), ChangeKind::Removed);
        }
        self.ops.push(JournalOp::RemoveAll {
            collection: collection.to_string(),
        });

        self.dispatch(collection, |hooks, txn| hooks.did_remove_all(txn, collection))
    }

    /// Report a record as changed without modifying it. Returns `false` if
    /// the record does not exist.
    pub fn touch(&mut self, collection: &str, key: &str) -> bool {
        if !self.snapshot.has(collection, key) {
            return false;
        }
        self.changes
            .record(EntityId::new(collection, key), ChangeKind::Touched);
        true
    }

    /// Changes recorded so far in this transaction.
    pub fn pending_changes(&self) -> &ChangesetBuilder {
        &self.changes
    }

    /// Number of hook frames currently executing. A hook fired by a caller's
    /// write sees 1; one fired by a hook write or a `will_commit` write sees 2.
    pub fn hook_depth(&self) -> usize {
        self.hook_stack.len()
    }

    pub(crate) fn run_commit_hooks(&mut self) -> StoreResult<()> {
        if let Some(reason) = &self.poisoned {
            return Err(StoreError::Aborted(reason.clone()));
        }
        let result = self.dispatch(COMMIT_SCOPE, |hooks, txn| hooks.will_commit(txn));
        self.poison_on_error(result)?;
        match &self.poisoned {
            Some(reason) => Err(StoreError::Aborted(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn into_parts(self) -> (Snapshot, Vec<JournalOp>, ChangesetBuilder) {
        (self.snapshot, self.ops, self.changes)
    }

    /// Rejects a write issued too deep in the hook stack. The rejection
    /// poisons the transaction even if the hook discards the error.
    fn check_cascade(&mut self, collection: &str, key: &str) -> StoreResult<()> {
        let depth = self.hook_stack.len();
        if depth > self.max_hook_depth || self.hook_stack.iter().any(|c| c == collection) {
            error!(
                collection,
                key,
                depth,
                stack = ?self.hook_stack,
                "hook cascade violation"
            );
            let err = StoreError::HookCascade {
                collection: collection.to_string(),
                key: key.to_string(),
                depth,
            };
            return self.poison_on_error(Err(err));
        }
        Ok(())
    }

    fn poison_on_error(&mut self, result: StoreResult<()>) -> StoreResult<()> {
        if let Err(e) = &result {
            if self.poisoned.is_none() {
                self.poisoned = Some(format!("earlier write failed: {e}"));
            }
        }
        result
    }

    fn apply_extensions(&mut self, change: &RowChange<'_>) -> StoreResult<()> {
        let slots = &mut self.snapshot.extensions;
        for i in 0..slots.len() {
            let (before, rest) = slots.split_at_mut(i);
            rest[0].state.apply(change, &Upstream::new(before))?;
        }
        Ok(())
    }

    /// Run `call` against every extension that provides hooks, with
    /// `scope` pushed on the hook stack.
    fn dispatch<F>(&mut self, scope: &str, mut call: F) -> StoreResult<()>
    where
        F: FnMut(&dyn RowHooks, &mut WriteTransaction) -> StoreResult<()>,
    {
        let hooked: Vec<Arc<dyn Extension>> = self
            .snapshot
            .extensions
            .iter()
            .filter(|slot| slot.extension.hooks().is_some())
            .map(|slot| Arc::clone(&slot.extension))
            .collect();
        if hooked.is_empty() {
            return Ok(());
        }

        self.hook_stack.push(scope.to_string());
        let mut result = Ok(());
        for extension in &hooked {
            if let Some(hooks) = extension.hooks() {
                result = call(hooks, self);
                if result.is_err() {
                    break;
                }
            }
        }
        self.hook_stack.pop();
        result
    }
}

impl Reader for WriteTransaction {
    fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base_seq", &self.snapshot.seq())
            .field("ops", &self.ops.len())
            .field("hook_depth", &self.hook_stack.len())
            .finish()
    }
}
