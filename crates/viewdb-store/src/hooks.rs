use crate::codec::AnyObject;
use crate::error::StoreResult;
use crate::transaction::WriteTransaction;

/// Callbacks fired by a write transaction around each row mutation.
///
/// Hooks run synchronously inside the transaction; writes they issue are
/// part of the same atomic commit. A hook may write to collections other
/// than the one that triggered it, but writes from hooks that are
/// themselves running because of a hook write are rejected with
/// [`StoreError::HookCascade`](crate::StoreError::HookCascade).
///
/// Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait RowHooks: Send + Sync {
    /// Before an insert or update. The previous value, if any, is still stored.
    fn will_modify(
        &self,
        txn: &mut WriteTransaction,
        collection: &str,
        key: &str,
        object: &AnyObject,
    ) -> StoreResult<()> {
        Ok(())
    }

    /// After an insert or update. Extension states already reflect the write.
    fn did_modify(
        &self,
        txn: &mut WriteTransaction,
        collection: &str,
        key: &str,
        object: &AnyObject,
    ) -> StoreResult<()> {
        Ok(())
    }

    /// Before a removal. The row is still readable and still present in views.
    fn will_remove(&self, txn: &mut WriteTransaction, collection: &str, key: &str) -> StoreResult<()> {
        Ok(())
    }

    /// After a removal.
    fn did_remove(&self, txn: &mut WriteTransaction, collection: &str, key: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Before every row of a collection is removed.
    fn will_remove_all(&self, txn: &mut WriteTransaction, collection: &str) -> StoreResult<()> {
        Ok(())
    }

    /// After every row of a collection has been removed.
    fn did_remove_all(&self, txn: &mut WriteTransaction, collection: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Once per transaction, after the caller's work and before commit.
    ///
    /// Writes issued here count as one hook hop, so row hooks they fire run
    /// at [`hook_depth`](WriteTransaction::hook_depth) 2 and cannot write
    /// further. Extensions that skip hook-issued writes also skip these.
    fn will_commit(&self, txn: &mut WriteTransaction) -> StoreResult<()> {
        Ok(())
    }
}
