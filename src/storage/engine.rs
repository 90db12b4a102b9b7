use async_trait::async_trait;
use thiserror::Error;

use crate::rpc::{KeyError, Mutation, TxnStatus};
use crate::types::{Key, KvPair, Timestamp, Value};

/// Errors surfaced by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key error: {0:?}")]
    Key(KeyError),
    #[error("{} key errors", .0.len())]
    Keys(Vec<KeyError>),
    #[error("MVCC state is corrupted: {0}")]
    CorruptedState(String),
}

impl From<KeyError> for StorageError {
    fn from(err: KeyError) -> Self {
        StorageError::Key(err)
    }
}

/// Percolator-style MVCC contract served by a region store.
///
/// Every mutating call validates all keys before touching any of them, so a
/// rejected request leaves no partial state behind.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Value visible at `ts`. Fails with a `Locked` key error if a lock
    /// from a transaction started at or before `ts` sits on the key.
    async fn get(&self, key: &Key, ts: Timestamp) -> Result<Option<Value>, StorageError>;

    /// Visible values for the unlocked subset of `keys`, plus a `Locked`
    /// error for every key a lock is in the way of.
    async fn batch_get(&self, keys: &[Key], ts: Timestamp) -> (Vec<KvPair>, Vec<KeyError>);

    /// Up to `limit` visible pairs in `[start, end)`; an empty `end` is unbounded.
    async fn scan(
        &self,
        start: &Key,
        end: &Key,
        limit: usize,
        ts: Timestamp,
    ) -> Result<Vec<KvPair>, StorageError>;

    async fn prewrite(
        &self,
        mutations: Vec<Mutation>,
        primary: &Key,
        start_ts: Timestamp,
        lock_ttl_ms: u64,
    ) -> Result<(), StorageError>;

    async fn commit(
        &self,
        keys: &[Key],
        start_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> Result<(), StorageError>;

    async fn rollback(&self, keys: &[Key], start_ts: Timestamp) -> Result<(), StorageError>;

    /// Reports (and, for expired or missing primaries, settles) the outcome
    /// of the transaction started at `lock_ts`.
    async fn check_txn_status(
        &self,
        primary: &Key,
        lock_ts: Timestamp,
        current_ts: Timestamp,
        rollback_if_not_exist: bool,
    ) -> Result<TxnStatus, StorageError>;

    /// Commits (`Some`) or rolls back (`None`) the locks `start_ts` holds on `keys`.
    async fn resolve_lock(
        &self,
        keys: &[Key],
        start_ts: Timestamp,
        commit_ts: Option<Timestamp>,
    ) -> Result<(), StorageError>;

    /// Prunes versions no reader at or above `safe_point` can observe.
    async fn gc(&self, safe_point: Timestamp) -> usize;
}
