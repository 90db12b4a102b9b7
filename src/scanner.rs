use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::backoff::Backoff;
use crate::error::Result;
use crate::rpc::{KeyError, Request, RequestKind, Response};
use crate::store::StoreInner;
use crate::types::{Key, KvPair, Timestamp};

/// Lazy ordered cursor over a remote key range at a fixed timestamp.
///
/// Pairs arrive in batches of `scan_batch_size`, one region at a time. The
/// resume point only moves past a key once a batch containing it has been
/// received, so a batch retried after a routing failure neither skips nor
/// repeats keys.
pub struct Scanner {
    inner: Arc<StoreInner>,
    start_ts: Timestamp,
    next_start: Key,
    end: Key,
    batch: VecDeque<KvPair>,
    exhausted: bool,
}

impl Scanner {
    pub(crate) async fn open(
        inner: Arc<StoreInner>,
        start_ts: Timestamp,
        start: Key,
        end: Key,
    ) -> Result<Self> {
        let exhausted = !end.is_empty() && start >= end;
        let mut scanner = Self {
            inner,
            start_ts,
            next_start: start,
            end,
            batch: VecDeque::new(),
            exhausted,
        };
        scanner.fill().await?;
        Ok(scanner)
    }

    /// False once every pair in the range has been consumed.
    pub fn valid(&self) -> bool {
        !self.batch.is_empty()
    }

    pub fn key(&self) -> Option<&Key> {
        self.current().map(|pair| &pair.key)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current().map(|pair| pair.value.as_slice())
    }

    pub fn current(&self) -> Option<&KvPair> {
        self.batch.front()
    }

    /// Moves to the next pair, fetching another batch when needed.
    pub async fn next(&mut self) -> Result<()> {
        self.batch.pop_front();
        self.fill().await
    }

    async fn fill(&mut self) -> Result<()> {
        let limit = self.inner.config.scan_batch_size.max(1);
        let version = self.start_ts;
        let mut lock_backoff = Backoff::new(self.inner.config.lock_retry);

        while self.batch.is_empty() && !self.exhausted {
            self.inner.safe_point.check(self.start_ts).await?;
            let (response, region) = self
                .inner
                .dispatcher
                .send_scan(&self.next_start, &self.end, |start_key, end_key| Request::Scan {
                    start_key,
                    end_key,
                    limit,
                    version,
                })
                .await?;

            match response {
                Response::Scan { pairs, error: None } => {
                    if pairs.len() >= limit as usize {
                        if let Some(last) = pairs.last() {
                            self.next_start = last.key.next_key();
                        }
                    } else if region.end_key.is_empty()
                        || (!self.end.is_empty() && region.end_key >= self.end)
                    {
                        self.exhausted = true;
                    } else {
                        self.next_start = region.end_key.clone();
                    }
                    debug!(region_id = region.id, fetched = pairs.len(), "scan batch");
                    self.batch.extend(pairs);
                }
                Response::Scan {
                    error: Some(KeyError::Locked(lock)),
                    ..
                } => {
                    self.inner
                        .resolver
                        .resolve_or_wait(vec![lock], &mut lock_backoff)
                        .await?
                }
                Response::Scan {
                    error: Some(err), ..
                } => return Err(err.into()),
                other => return Err(other.mismatch(RequestKind::Scan)),
            }
        }
        Ok(())
    }
}
