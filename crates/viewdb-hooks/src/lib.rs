//! Closure-based row hooks.
//!
//! [`Hooks`] bundles optional callbacks for each [`RowHooks`] point and
//! registers as an ordinary store extension:
//!
//! ```ignore
//! let hooks = Hooks::new()
//!     .only(["messages"])
//!     .on_did_modify(|txn, collection, key, object| { /* ... */ Ok(()) });
//! db.register("hooks", hooks)?;
//! ```

use std::collections::HashSet;

use tracing::trace;
use viewdb_store::{
    AnyObject, BuildContext, Extension, ExtensionState, RowHooks, StatelessState, StoreResult,
    WriteTransaction,
};

type ModifyFn = Box<dyn Fn(&mut WriteTransaction, &str, &str, &AnyObject) -> StoreResult<()> + Send + Sync>;
type RemoveFn = Box<dyn Fn(&mut WriteTransaction, &str, &str) -> StoreResult<()> + Send + Sync>;
type RemoveAllFn = Box<dyn Fn(&mut WriteTransaction, &str) -> StoreResult<()> + Send + Sync>;
type CommitFn = Box<dyn Fn(&mut WriteTransaction) -> StoreResult<()> + Send + Sync>;

/// A set of row callbacks. Unset callbacks are no-ops.
#[derive(Default)]
pub struct Hooks {
    allowed: Option<HashSet<String>>,
    will_modify: Option<ModifyFn>,
    did_modify: Option<ModifyFn>,
    will_remove: Option<RemoveFn>,
    did_remove: Option<RemoveFn>,
    will_remove_all: Option<RemoveAllFn>,
    did_remove_all: Option<RemoveAllFn>,
    will_commit: Option<CommitFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire row callbacks only for these collections.
    /// `will_commit` always fires.
    pub fn only<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    pub fn on_will_modify<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction, &str, &str, &AnyObject) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.will_modify = Some(Box::new(f));
        self
    }

    pub fn on_did_modify<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction, &str, &str, &AnyObject) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.did_modify = Some(Box::new(f));
        self
    }

    pub fn on_will_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction, &str, &str) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.will_remove = Some(Box::new(f));
        self
    }

    pub fn on_did_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction, &str, &str) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.did_remove = Some(Box::new(f));
        self
    }

    pub fn on_will_remove_all<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction, &str) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.will_remove_all = Some(Box::new(f));
        self
    }

    pub fn on_did_remove_all<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction, &str) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.did_remove_all = Some(Box::new(f));
        self
    }

    pub fn on_will_commit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.will_commit = Some(Box::new(f));
        self
    }

    fn fires_for(&self, collection: &str) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(collection))
    }
}

impl RowHooks for Hooks {
    fn will_modify(
        &self,
        txn: &mut WriteTransaction,
        collection: &str,
        key: &str,
        object: &AnyObject,
    ) -> StoreResult<()> {
        match &self.will_modify {
            Some(f) if self.fires_for(collection) => {
                trace!(collection, key, "will_modify");
                f(txn, collection, key, object)
            }
            _ => Ok(()),
        }
    }

    fn did_modify(
        &self,
        txn: &mut WriteTransaction,
        collection: &str,
        key: &str,
        object: &AnyObject,
    ) -> StoreResult<()> {
        match &self.did_modify {
            Some(f) if self.fires_for(collection) => {
                trace!(collection, key, "did_modify");
                f(txn, collection, key, object)
            }
            _ => Ok(()),
        }
    }

    fn will_remove(&self, txn: &mut WriteTransaction, collection: &str, key: &str) -> StoreResult<()> {
        match &self.will_remove {
            Some(f) if self.fires_for(collection) => {
                trace!(collection, key, "will_remove");
                f(txn, collection, key)
            }
            _ => Ok(()),
        }
    }

    fn did_remove(&self, txn: &mut WriteTransaction, collection: &str, key: &str) -> StoreResult<()> {
        match &self.did_remove {
            Some(f) if self.fires_for(collection) => {
                trace!(collection, key, "did_remove");
                f(txn, collection, key)
            }
            _ => Ok(()),
        }
    }

    fn will_remove_all(&self, txn: &mut WriteTransaction, collection: &str) -> StoreResult<()> {
        match &self.will_remove_all {
            Some(f) if self.fires_for(collection) => {
                trace!(collection, "will_remove_all");
                f(txn, collection)
            }
            _ => Ok(()),
        }
    }

    fn did_remove_all(&self, txn: &mut WriteTransaction, collection: &str) -> StoreResult<()> {
        match &self.did_remove_all {
            Some(f) if self.fires_for(collection) => {
                trace!(collection, "did_remove_all");
                f(txn, collection)
            }
            _ => Ok(()),
        }
    }

    fn will_commit(&self, txn: &mut WriteTransaction) -> StoreResult<()> {
        match &self.will_commit {
            Some(f) => {
                trace!("will_commit");
                f(txn)
            }
            None => Ok(()),
        }
    }
}

impl Extension for Hooks {
    fn kind(&self) -> &'static str {
        "hooks"
    }

    fn version_tag(&self) -> &str {
        ""
    }

    fn build(&self, _ctx: &BuildContext<'_>) -> StoreResult<Box<dyn ExtensionState>> {
        Ok(Box::new(StatelessState))
    }

    fn hooks(&self) -> Option<&dyn RowHooks> {
        Some(self)
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("allowed", &self.allowed)
            .field("will_modify", &self.will_modify.is_some())
            .field("did_modify", &self.did_modify.is_some())
            .field("will_remove", &self.will_remove.is_some())
            .field("did_remove", &self.did_remove.is_some())
            .field("will_commit", &self.will_commit.is_some())
            .finish()
    }
}
