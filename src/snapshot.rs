use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::rpc::{KeyError, Request, RequestKind, Response};
use crate::scanner::Scanner;
use crate::store::StoreInner;
use crate::types::{Key, KvPair, Timestamp, Value};

/// Read-only view of the database as of one timestamp.
///
/// Reads fail fast with [`Error::GcExpired`] if the timestamp has fallen
/// below the GC safe point. Foreign locks in the way are resolved through
/// the lock resolver; a lock whose owner stays alive past the lock-wait
/// budget surfaces as a `Conflict`.
#[derive(Clone)]
pub struct Snapshot {
    start_ts: Timestamp,
    inner: Arc<StoreInner>,
}

impl Snapshot {
    pub(crate) fn new(inner: Arc<StoreInner>, start_ts: Timestamp) -> Self {
        Self { start_ts, inner }
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Value of `key` as of the snapshot, `None` if absent or deleted.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.inner.safe_point.check(self.start_ts).await?;

        let mut lock_backoff = Backoff::new(self.inner.config.lock_retry);
        loop {
            let request = Request::Get {
                key: key.clone(),
                version: self.start_ts,
            };
            match self.inner.dispatcher.send_to_key(&key, request).await? {
                Response::Get { value, error: None } => return Ok(value),
                Response::Get {
                    error: Some(KeyError::Locked(lock)),
                    ..
                } => {
                    self.inner
                        .resolver
                        .resolve_or_wait(vec![lock], &mut lock_backoff)
                        .await?
                }
                Response::Get {
                    error: Some(err), ..
                } => return Err(err.into()),
                other => return Err(other.mismatch(RequestKind::Get)),
            }
        }
    }

    /// Present values among `keys`, sorted by key. Missing keys are omitted.
    pub async fn batch_get(&self, keys: impl IntoIterator<Item = impl Into<Key>>) -> Result<Vec<KvPair>> {
        let keys: BTreeSet<Key> = keys.into_iter().map(Into::into).collect();
        if keys.iter().any(|key| key.is_empty()) {
            return Err(Error::EmptyKey);
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.safe_point.check(self.start_ts).await?;

        let version = self.start_ts;
        let mut pending: Vec<Key> = keys.into_iter().collect();
        let mut found = Vec::new();
        let mut lock_backoff = Backoff::new(self.inner.config.lock_retry);
        loop {
            let responses = self
                .inner
                .dispatcher
                .send_batch(pending, |keys| Request::BatchGet { keys, version })
                .await?;

            let mut locks = Vec::new();
            for response in responses {
                match response {
                    Response::BatchGet { pairs, errors } => {
                        found.extend(pairs);
                        for err in errors {
                            match err {
                                KeyError::Locked(lock) => locks.push(lock),
                                other => return Err(other.into()),
                            }
                        }
                    }
                    other => return Err(other.mismatch(RequestKind::BatchGet)),
                }
            }
            if locks.is_empty() {
                break;
            }

            pending = locks.iter().map(|lock| lock.key.clone()).collect();
            self.inner
                .resolver
                .resolve_or_wait(locks, &mut lock_backoff)
                .await?;
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    /// Ordered scan over `[start, end)`; an empty `end` scans to the end of
    /// the key space. Pairs are fetched lazily in batches.
    pub async fn scan(&self, start: impl Into<Key>, end: impl Into<Key>) -> Result<Scanner> {
        Scanner::open(Arc::clone(&self.inner), self.start_ts, start.into(), end.into()).await
    }
}
