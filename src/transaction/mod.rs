//! Client-side transactions: local write buffer, merged iteration and the
//! two-phase commit that publishes the buffer.

mod buffer;
mod committer;
mod iter;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub use buffer::WriteBuffer;
pub use committer::TransactionState;
pub use iter::UnionIter;

use crate::error::Result;
use crate::rpc::Op;
use crate::snapshot::Snapshot;
use crate::store::StoreInner;
use crate::types::{Key, KvPair, Timestamp, Value};

use committer::TwoPhaseCommitter;

/// Result returned when a transaction successfully commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub start_ts: Timestamp,
    /// `None` for a transaction that wrote nothing.
    pub commit_ts: Option<Timestamp>,
}

/// Snapshot-isolated transaction owned by a single caller.
///
/// Reads see the snapshot at `start_ts` overlaid with the transaction's own
/// writes. Writes stay local until [`Transaction::commit`]. Both `commit`
/// and `rollback` consume the handle.
pub struct Transaction {
    snapshot: Snapshot,
    buffer: WriteBuffer,
    inner: Arc<StoreInner>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<StoreInner>, start_ts: Timestamp) -> Self {
        debug!(%start_ts, "begin transaction");
        Self {
            snapshot: Snapshot::new(Arc::clone(&inner), start_ts),
            buffer: WriteBuffer::new(inner.config.txn_limits),
            inner,
            finished: false,
        }
    }

    pub fn start_ts(&self) -> Timestamp {
        self.snapshot.start_ts()
    }

    /// Buffered entries.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.buffer.is_empty()
    }

    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        match self.buffer.get(&key) {
            Some(Op::Put(value)) => Ok(Some(value.clone())),
            Some(Op::Delete) => Ok(None),
            None => self.snapshot.get(key).await,
        }
    }

    /// Present values among `keys`, own writes included, sorted by key.
    pub async fn batch_get(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        let keys: BTreeSet<Key> = keys.into_iter().map(Into::into).collect();
        let mut found = Vec::new();
        let mut remote = Vec::new();
        for key in keys {
            match self.buffer.get(&key) {
                Some(Op::Put(value)) => found.push(KvPair::new(key.clone(), value.clone())),
                Some(Op::Delete) => {}
                None => remote.push(key),
            }
        }
        if !remote.is_empty() {
            found.extend(self.snapshot.batch_get(remote).await?);
        }
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.buffer.put(key.into(), value.into())
    }

    pub fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        self.buffer.delete(key.into())
    }

    /// Ordered iteration over `[start, end)` as this transaction sees it.
    /// An empty `end` runs to the end of the key space.
    pub async fn iter(&self, start: impl Into<Key>, end: impl Into<Key>) -> Result<UnionIter> {
        let (start, end) = (start.into(), end.into());
        let local = self.buffer.range(&start, &end);
        let remote = self.snapshot.scan(start, end).await?;
        UnionIter::new(local, remote).await
    }

    /// Publishes the buffered writes atomically at a fresh commit timestamp.
    ///
    /// On `Conflict` or `GcExpired` the caller should retry from
    /// [`KvStore::begin`](crate::KvStore::begin). `Aborted` guarantees none
    /// of the writes became visible; `Undetermined` means the outcome could
    /// not be established.
    pub async fn commit(self) -> Result<CommitReceipt> {
        self.finish(None).await
    }

    /// Like [`commit`](Self::commit), but gives up with `Aborted` when
    /// `timeout` elapses before the primary commit is sent. Writes already
    /// prewritten are rolled back. A commit whose primary is in flight is
    /// always seen through, so the call can outlast `timeout` by up to one
    /// retried commit RPC.
    pub async fn commit_with_deadline(self, timeout: Duration) -> Result<CommitReceipt> {
        self.finish(Some(Instant::now() + timeout)).await
    }

    async fn finish(mut self, deadline: Option<Instant>) -> Result<CommitReceipt> {
        self.finished = true;
        let start_ts = self.start_ts();
        let buffer = std::mem::take(&mut self.buffer);
        let mutations = buffer.into_mutations();
        let Some(committer) = TwoPhaseCommitter::new(Arc::clone(&self.inner), start_ts, mutations)
        else {
            debug!(%start_ts, "read-only transaction finished");
            return Ok(CommitReceipt {
                start_ts,
                commit_ts: None,
            });
        };

        let committer = match deadline {
            Some(deadline) => committer.with_deadline(deadline),
            None => committer,
        };
        let commit_ts = committer.execute().await?;
        debug!(%start_ts, %commit_ts, "transaction committed");
        Ok(CommitReceipt {
            start_ts,
            commit_ts: Some(commit_ts),
        })
    }

    /// Discards every buffered write. Nothing has reached a store before
    /// commit, so there is no remote state to undo.
    pub fn rollback(mut self) {
        self.finished = true;
        debug!(start_ts = %self.start_ts(), discarded = self.buffer.len(), "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.buffer.is_empty() {
            debug!(
                start_ts = %self.start_ts(),
                discarded = self.buffer.len(),
                "transaction dropped without commit or rollback"
            );
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("start_ts", &self.start_ts())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
