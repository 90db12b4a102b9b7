//! Settles locks left behind by other transactions.
//!
//! A reader (or prewriter) that trips over a foreign lock asks the lock's
//! primary key what happened to the owning transaction, then rolls the
//! lock forward or back to match. Any number of parties may do this
//! concurrently; every step is idempotent on the store side.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::backoff::Backoff;
use crate::error::{ConflictReason, Error, Result};
use crate::oracle::Oracle;
use crate::rpc::{Dispatcher, LockInfo, Request, RequestKind, Response, TxnStatus};
use crate::types::Timestamp;

const RESOLVED_CACHE_CAPACITY: usize = 4_096;

pub struct LockResolver {
    dispatcher: Arc<Dispatcher>,
    oracle: Arc<Oracle>,
    /// Final outcomes by start timestamp. Final states never change, so
    /// entries never go stale.
    resolved: Mutex<HashMap<Timestamp, TxnStatus>>,
}

impl LockResolver {
    pub fn new(dispatcher: Arc<Dispatcher>, oracle: Arc<Oracle>) -> Self {
        Self {
            dispatcher,
            oracle,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Tries to settle every lock. Returns `true` when all of them are gone,
    /// `false` when at least one owner is still alive.
    pub async fn resolve_locks(&self, locks: Vec<LockInfo>) -> Result<bool> {
        let mut by_txn: BTreeMap<Timestamp, Vec<LockInfo>> = BTreeMap::new();
        for lock in locks {
            by_txn.entry(lock.start_ts).or_default().push(lock);
        }

        let mut all_resolved = true;
        for (start_ts, locks) in by_txn {
            let Some(first) = locks.first() else {
                continue;
            };
            match self.check_txn_status(first).await? {
                TxnStatus::Committed { commit_ts } => {
                    self.resolve(start_ts, locks, Some(commit_ts)).await?
                }
                TxnStatus::RolledBack => self.resolve(start_ts, locks, None).await?,
                TxnStatus::Locked { .. } | TxnStatus::NotFound => {
                    debug!(%start_ts, "lock owner still alive");
                    all_resolved = false;
                }
            }
        }
        Ok(all_resolved)
    }

    /// Resolves `locks`, and if some owner is still alive spends one step of
    /// `backoff` waiting for it. Once the budget is gone the caller gets a
    /// `Conflict` naming the first blocking lock.
    pub async fn resolve_or_wait(&self, locks: Vec<LockInfo>, backoff: &mut Backoff) -> Result<()> {
        let Some(blocker) = locks.first().cloned() else {
            return Ok(());
        };
        if self.resolve_locks(locks).await? || backoff.wait().await {
            return Ok(());
        }
        Err(Error::Conflict {
            key: blocker.key,
            reason: ConflictReason::Locked {
                holder_start_ts: blocker.start_ts,
            },
        })
    }

    /// Asks the primary key about the transaction owning `lock`. The primary
    /// is rolled back on the store's side if the lock has outlived its TTL.
    pub async fn check_txn_status(&self, lock: &LockInfo) -> Result<TxnStatus> {
        if let Some(status) = self.resolved.lock().await.get(&lock.start_ts) {
            return Ok(*status);
        }

        let current_ts = self.oracle.get_timestamp().await?;
        let request = Request::CheckTxnStatus {
            primary: lock.primary.clone(),
            lock_ts: lock.start_ts,
            current_ts,
            rollback_if_not_exist: lock.is_expired(current_ts),
        };
        let status = match self.dispatcher.send_to_key(&lock.primary, request).await? {
            Response::CheckTxnStatus { status } => status,
            other => return Err(other.mismatch(RequestKind::CheckTxnStatus)),
        };
        debug!(start_ts = %lock.start_ts, primary = %lock.primary, ?status, "checked txn status");

        if status.is_final() {
            let mut resolved = self.resolved.lock().await;
            if resolved.len() >= RESOLVED_CACHE_CAPACITY {
                resolved.clear();
            }
            resolved.insert(lock.start_ts, status);
        }
        Ok(status)
    }

    async fn resolve(
        &self,
        start_ts: Timestamp,
        locks: Vec<LockInfo>,
        commit_ts: Option<Timestamp>,
    ) -> Result<()> {
        let keys = locks.into_iter().map(|lock| lock.key).collect();
        let responses = self
            .dispatcher
            .send_batch(keys, |keys| Request::ResolveLock {
                keys,
                start_ts,
                commit_ts,
            })
            .await?;
        for response in responses {
            match response {
                Response::ResolveLock { error: None } => {}
                Response::ResolveLock { error: Some(err) } => return Err(err.into()),
                other => return Err(other.mismatch(RequestKind::ResolveLock)),
            }
        }
        debug!(%start_ts, ?commit_ts, "resolved locks");
        Ok(())
    }
}
