use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::rpc::{KeyError, LockInfo, Mutation, TxnStatus};
use crate::types::{Key, KvPair, Timestamp, Value};

use super::engine::{StorageEngine, StorageError};
use super::mvcc::{Lock, VersionChain, WriteKind, WriteRecord};

#[derive(Debug, Default)]
struct KeyState {
    lock: Option<Lock>,
    chain: VersionChain,
}

impl KeyState {
    fn read(&self, key: &Key, ts: Timestamp) -> Result<Option<Value>, KeyError> {
        if let Some(lock) = &self.lock {
            if lock.start_ts <= ts {
                return Err(KeyError::Locked(lock.info(key)));
            }
        }
        Ok(self.chain.value_at(ts).cloned())
    }

    fn lock_of(&self, start_ts: Timestamp) -> Option<&Lock> {
        self.lock.as_ref().filter(|lock| lock.start_ts == start_ts)
    }
}

/// Whether a validated key still needs work or was already handled by an
/// earlier attempt of the same request.
enum Step {
    Apply,
    Skip,
}

/// In-memory implementation of the `StorageEngine` trait: one lock slot and
/// one write-record chain per key.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    keys: RwLock<BTreeMap<Key, KeyState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outstanding lock in key order.
    pub async fn locks(&self) -> Vec<LockInfo> {
        let keys = self.keys.read().await;
        keys.iter()
            .filter_map(|(key, state)| state.lock.as_ref().map(|lock| lock.info(key)))
            .collect()
    }

    /// Write records of `key`, oldest first.
    pub async fn write_records(&self, key: &Key) -> Vec<WriteRecord> {
        let keys = self.keys.read().await;
        keys.get(key)
            .map(|state| state.chain.versions.clone())
            .unwrap_or_default()
    }
}

fn prewrite_step(
    state: Option<&KeyState>,
    key: &Key,
    start_ts: Timestamp,
) -> Result<Step, KeyError> {
    let Some(state) = state else {
        return Ok(Step::Apply);
    };
    if let Some(lock) = &state.lock {
        if lock.start_ts == start_ts {
            return Ok(Step::Skip);
        }
        return Err(KeyError::Locked(lock.info(key)));
    }
    if let Some(own) = state.chain.find_by_start_ts(start_ts) {
        if own.is_rollback() {
            return Err(KeyError::AlreadyRolledBack {
                key: key.clone(),
                start_ts,
            });
        }
        return Ok(Step::Skip);
    }
    if let Some(newer) = state.chain.newer_than(start_ts) {
        return Err(KeyError::WriteConflict {
            key: key.clone(),
            start_ts,
            conflict_commit_ts: newer.commit_ts,
        });
    }
    Ok(Step::Apply)
}

fn commit_step(state: Option<&KeyState>, key: &Key, start_ts: Timestamp) -> Result<Step, KeyError> {
    if let Some(state) = state {
        if state.lock_of(start_ts).is_some() {
            return Ok(Step::Apply);
        }
        match state.chain.find_by_start_ts(start_ts) {
            Some(record) if record.is_rollback() => {
                return Err(KeyError::AlreadyRolledBack {
                    key: key.clone(),
                    start_ts,
                });
            }
            Some(_) => return Ok(Step::Skip),
            None => {}
        }
    }
    Err(KeyError::LockNotFound {
        key: key.clone(),
        start_ts,
    })
}

fn rollback_step(
    state: Option<&KeyState>,
    key: &Key,
    start_ts: Timestamp,
) -> Result<Step, KeyError> {
    let Some(state) = state else {
        return Ok(Step::Apply);
    };
    if state.lock_of(start_ts).is_some() {
        return Ok(Step::Apply);
    }
    match state.chain.find_by_start_ts(start_ts) {
        Some(record) if record.is_rollback() => Ok(Step::Skip),
        Some(record) => Err(KeyError::AlreadyCommitted {
            key: key.clone(),
            start_ts,
            commit_ts: record.commit_ts,
        }),
        // Leave a tombstone so a delayed prewrite cannot resurrect the txn.
        None => Ok(Step::Apply),
    }
}

/// Releases `start_ts`'s lock on `state` (if held) and records the outcome.
fn settle(state: &mut KeyState, start_ts: Timestamp, commit_ts: Option<Timestamp>) {
    let lock = match &state.lock {
        Some(lock) if lock.start_ts == start_ts => state.lock.take(),
        _ => None,
    };
    match (lock, commit_ts) {
        (Some(lock), Some(commit_ts)) => {
            state
                .chain
                .append(WriteRecord::committed(start_ts, commit_ts, lock.op));
        }
        _ => state.chain.append(WriteRecord::rollback(start_ts)),
    }
}

#[async_trait::async_trait]
impl StorageEngine for InMemoryStorage {
    async fn get(&self, key: &Key, ts: Timestamp) -> Result<Option<Value>, StorageError> {
        let keys = self.keys.read().await;
        match keys.get(key) {
            Some(state) => Ok(state.read(key, ts)?),
            None => Ok(None),
        }
    }

    async fn batch_get(&self, keys: &[Key], ts: Timestamp) -> (Vec<KvPair>, Vec<KeyError>) {
        let store = self.keys.read().await;
        let mut pairs = Vec::new();
        let mut locked = Vec::new();
        for key in keys {
            let Some(state) = store.get(key) else {
                continue;
            };
            match state.read(key, ts) {
                Ok(Some(value)) => pairs.push(KvPair::new(key.clone(), value)),
                Ok(None) => {}
                Err(err) => locked.push(err),
            }
        }
        (pairs, locked)
    }

    async fn scan(
        &self,
        start: &Key,
        end: &Key,
        limit: usize,
        ts: Timestamp,
    ) -> Result<Vec<KvPair>, StorageError> {
        let keys = self.keys.read().await;
        let mut pairs = Vec::new();
        for (key, state) in keys.range(start.clone()..) {
            if pairs.len() >= limit || (!end.is_empty() && key >= end) {
                break;
            }
            if let Some(value) = state.read(key, ts)? {
                pairs.push(KvPair::new(key.clone(), value));
            }
        }
        Ok(pairs)
    }

    async fn prewrite(
        &self,
        mutations: Vec<Mutation>,
        primary: &Key,
        start_ts: Timestamp,
        lock_ttl_ms: u64,
    ) -> Result<(), StorageError> {
        let mut keys = self.keys.write().await;
        let mut errors = Vec::new();
        let mut pending = Vec::new();
        for mutation in mutations {
            match prewrite_step(keys.get(&mutation.key), &mutation.key, start_ts) {
                Ok(Step::Apply) => pending.push(mutation),
                Ok(Step::Skip) => {}
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            return Err(StorageError::Keys(errors));
        }

        for mutation in pending {
            keys.entry(mutation.key).or_default().lock = Some(Lock {
                primary: primary.clone(),
                start_ts,
                ttl_ms: lock_ttl_ms,
                op: mutation.op,
            });
        }
        Ok(())
    }

    async fn commit(
        &self,
        keys: &[Key],
        start_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> Result<(), StorageError> {
        if commit_ts <= start_ts {
            return Err(StorageError::CorruptedState(format!(
                "commit_ts {commit_ts} does not exceed start_ts {start_ts}"
            )));
        }
        let mut store = self.keys.write().await;
        let mut pending = Vec::new();
        for key in keys {
            if let Step::Apply = commit_step(store.get(key), key, start_ts)? {
                pending.push(key);
            }
        }
        for key in pending {
            settle(store.entry(key.clone()).or_default(), start_ts, Some(commit_ts));
        }
        Ok(())
    }

    async fn rollback(&self, keys: &[Key], start_ts: Timestamp) -> Result<(), StorageError> {
        let mut store = self.keys.write().await;
        let mut pending = Vec::new();
        for key in keys {
            if let Step::Apply = rollback_step(store.get(key), key, start_ts)? {
                pending.push(key);
            }
        }
        for key in pending {
            settle(store.entry(key.clone()).or_default(), start_ts, None);
        }
        Ok(())
    }

    async fn check_txn_status(
        &self,
        primary: &Key,
        lock_ts: Timestamp,
        current_ts: Timestamp,
        rollback_if_not_exist: bool,
    ) -> Result<TxnStatus, StorageError> {
        let mut store = self.keys.write().await;
        if let Some(state) = store.get_mut(primary) {
            let held = state
                .lock_of(lock_ts)
                .map(|lock| (lock.ttl_ms, lock.info(primary).is_expired(current_ts)));
            match held {
                Some((_, true)) => {
                    debug!(%primary, %lock_ts, "rolling back expired primary lock");
                    settle(state, lock_ts, None);
                    return Ok(TxnStatus::RolledBack);
                }
                Some((ttl_ms, false)) => return Ok(TxnStatus::Locked { ttl_ms }),
                None => {}
            }
            if let Some(record) = state.chain.find_by_start_ts(lock_ts) {
                return Ok(match record.kind {
                    WriteKind::Rollback => TxnStatus::RolledBack,
                    _ => TxnStatus::Committed {
                        commit_ts: record.commit_ts,
                    },
                });
            }
        }

        if rollback_if_not_exist {
            settle(store.entry(primary.clone()).or_default(), lock_ts, None);
            return Ok(TxnStatus::RolledBack);
        }
        Ok(TxnStatus::NotFound)
    }

    async fn resolve_lock(
        &self,
        keys: &[Key],
        start_ts: Timestamp,
        commit_ts: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        let mut store = self.keys.write().await;
        for key in keys {
            if let Some(state) = store.get_mut(key) {
                if state.lock_of(start_ts).is_some() {
                    settle(state, start_ts, commit_ts);
                }
            }
        }
        Ok(())
    }

    async fn gc(&self, safe_point: Timestamp) -> usize {
        let mut store = self.keys.write().await;
        let mut removed = 0;
        for state in store.values_mut() {
            removed += state.chain.gc(safe_point);
        }
        store.retain(|_, state| state.lock.is_some() || !state.chain.is_empty());
        removed
    }
}
