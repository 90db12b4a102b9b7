use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::rpc::{KeyError, Mutation, Op, Request, RequestKind, Response};
use crate::store::StoreInner;
use crate::types::{Key, Timestamp};

/// Phases a commit attempt moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prewriting,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

/// Drives one transaction's write set through Percolator two-phase commit.
///
/// The smallest key is the primary. Prewrites run per region in parallel and
/// stop as soon as one of them fails. The transaction counts as committed
/// the moment the primary's commit is acknowledged; secondaries are then
/// finished on a best-effort basis, and any stragglers are rolled forward by
/// readers that find them.
///
/// An optional deadline bounds everything up to the primary commit. Once the
/// primary commit is sent the outcome is settled regardless of the deadline.
pub(crate) struct TwoPhaseCommitter {
    inner: Arc<StoreInner>,
    start_ts: Timestamp,
    primary: Key,
    mutations: Arc<BTreeMap<Key, Op>>,
    state: TransactionState,
    deadline: Option<Instant>,
}

impl TwoPhaseCommitter {
    /// `None` when there is nothing to write.
    pub(crate) fn new(
        inner: Arc<StoreInner>,
        start_ts: Timestamp,
        mutations: BTreeMap<Key, Op>,
    ) -> Option<Self> {
        let primary = mutations.keys().next()?.clone();
        Some(Self {
            inner,
            start_ts,
            primary,
            mutations: Arc::new(mutations),
            state: TransactionState::Active,
            deadline: None,
        })
    }

    pub(crate) fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) async fn execute(mut self) -> Result<Timestamp> {
        // Conflicts with versions below the safe point can no longer be seen.
        self.inner.safe_point.check(self.start_ts).await?;

        self.enter(TransactionState::Prewriting);
        let prewritten = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.prewrite())
                .await
                .unwrap_or_else(|_| Err(Self::deadline_elapsed("prewrite finished"))),
            None => self.prewrite().await,
        };
        if let Err(err) = prewritten {
            self.rollback_all().await;
            return Err(err);
        }

        let commit_ts = match self.inner.oracle.get_timestamp().await {
            Ok(ts) if ts > self.start_ts => ts,
            Ok(ts) => {
                self.rollback_all().await;
                return Err(Error::Fatal(format!(
                    "commit timestamp {ts} does not exceed start timestamp {}",
                    self.start_ts
                )));
            }
            Err(err) => {
                self.rollback_all().await;
                return Err(err);
            }
        };

        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.rollback_all().await;
            return Err(Self::deadline_elapsed("the primary commit"));
        }

        self.enter(TransactionState::Committing);
        self.commit_primary(commit_ts).await?;
        self.enter(TransactionState::Committed);
        self.commit_secondaries(commit_ts).await;
        Ok(commit_ts)
    }

    fn deadline_elapsed(phase: &str) -> Error {
        Error::Aborted {
            reason: format!("commit deadline elapsed before {phase}"),
        }
    }

    fn enter(&mut self, next: TransactionState) {
        debug!(start_ts = %self.start_ts, from = ?self.state, to = ?next, "commit phase");
        self.state = next;
    }

    async fn prewrite(&self) -> Result<()> {
        let groups = self
            .inner
            .dispatcher
            .region_cache()
            .group_keys(self.mutations.keys().cloned())
            .await
            .map(|groups| groups.into_iter().map(|(_, keys)| keys).collect::<Vec<_>>())
            // Routing trouble is retried inside each task.
            .unwrap_or_else(|_| vec![self.mutations.keys().cloned().collect()]);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for keys in groups {
            let job = PrewriteJob {
                inner: Arc::clone(&self.inner),
                mutations: Arc::clone(&self.mutations),
                primary: self.primary.clone(),
                start_ts: self.start_ts,
            };
            tasks.spawn(job.run(keys, cancel_rx.clone()));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .unwrap_or_else(|err| Err(Error::Fatal(format!("prewrite task failed: {err}"))));
            if let Err(err) = outcome {
                if first_error.is_none() {
                    let _ = cancel_tx.send(true);
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => {
                debug!(start_ts = %self.start_ts, error = %err, "prewrite failed");
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn commit_primary(&mut self, commit_ts: Timestamp) -> Result<()> {
        let request = Request::Commit {
            keys: vec![self.primary.clone()],
            start_ts: self.start_ts,
            commit_ts,
        };
        let cause = match self.inner.dispatcher.send_to_key(&self.primary, request).await {
            Ok(Response::Commit { error: None }) => return Ok(()),
            Ok(Response::Commit { error: Some(err) }) => {
                let err = Error::from(err);
                warn!(start_ts = %self.start_ts, error = %err, "primary commit rejected");
                self.rollback_all().await;
                return Err(Error::Aborted {
                    reason: err.to_string(),
                });
            }
            Ok(other) => other.mismatch(RequestKind::Commit),
            Err(err) => err,
        };
        self.settle_primary(cause).await
    }

    /// The primary commit produced no verdict. Rolling the primary back
    /// either decides the outcome or proves it was committed after all.
    async fn settle_primary(&mut self, cause: Error) -> Result<()> {
        warn!(start_ts = %self.start_ts, error = %cause, "primary commit outcome unknown");
        let request = Request::BatchRollback {
            keys: vec![self.primary.clone()],
            start_ts: self.start_ts,
        };
        match self.inner.dispatcher.send_to_key(&self.primary, request).await {
            Ok(Response::BatchRollback {
                error: Some(KeyError::AlreadyCommitted { .. }),
            }) => Ok(()),
            Ok(Response::BatchRollback { error: None }) => {
                self.rollback_all().await;
                Err(Error::Aborted {
                    reason: format!("primary commit failed: {cause}"),
                })
            }
            _ => Err(Error::Undetermined {
                reason: cause.to_string(),
            }),
        }
    }

    async fn commit_secondaries(&self, commit_ts: Timestamp) {
        let secondaries: Vec<Key> = self
            .mutations
            .keys()
            .filter(|key| **key != self.primary)
            .cloned()
            .collect();
        if secondaries.is_empty() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let start_ts = self.start_ts;
        let task = async move {
            if let Err(err) = commit_keys(&inner, secondaries, start_ts, commit_ts).await {
                warn!(%start_ts, %commit_ts, error = %err, "secondary commit failed; readers will roll locks forward");
            }
        };
        if self.inner.config.async_secondary_commit {
            tokio::spawn(task);
        } else {
            task.await;
        }
    }

    /// Best-effort rollback of every key; failures only leave locks that
    /// readers will clean up once they expire.
    async fn rollback_all(&mut self) {
        self.enter(TransactionState::RollingBack);
        let start_ts = self.start_ts;
        let keys: Vec<Key> = self.mutations.keys().cloned().collect();
        match self
            .inner
            .dispatcher
            .send_batch(keys, |keys| Request::BatchRollback { keys, start_ts })
            .await
        {
            Ok(responses) => {
                for response in responses {
                    if let Response::BatchRollback { error: Some(err) } = response {
                        warn!(%start_ts, error = ?err, "rollback rejected");
                    }
                }
            }
            Err(err) => warn!(%start_ts, error = %err, "rollback failed"),
        }
        self.enter(TransactionState::RolledBack);
    }
}

async fn commit_keys(
    inner: &StoreInner,
    keys: Vec<Key>,
    start_ts: Timestamp,
    commit_ts: Timestamp,
) -> Result<()> {
    let responses = inner
        .dispatcher
        .send_batch(keys, |keys| Request::Commit {
            keys,
            start_ts,
            commit_ts,
        })
        .await?;
    for response in responses {
        match response {
            Response::Commit { error: None } => {}
            Response::Commit { error: Some(err) } => return Err(err.into()),
            other => return Err(other.mismatch(RequestKind::Commit)),
        }
    }
    debug!(%start_ts, %commit_ts, "secondaries committed");
    Ok(())
}

/// Prewrite of one region's share of the write set, runnable on its own task.
struct PrewriteJob {
    inner: Arc<StoreInner>,
    mutations: Arc<BTreeMap<Key, Op>>,
    primary: Key,
    start_ts: Timestamp,
}

impl PrewriteJob {
    async fn run(self, keys: Vec<Key>, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut lock_backoff = Backoff::new(self.inner.config.lock_retry);
        loop {
            if *cancel.borrow() {
                return Err(Self::cancelled());
            }
            let responses = tokio::select! {
                responses = self.send(keys.clone()) => responses?,
                _ = cancel.changed() => return Err(Self::cancelled()),
            };

            let mut locks = Vec::new();
            for response in responses {
                match response {
                    Response::Prewrite { errors } => {
                        for err in errors {
                            match err {
                                KeyError::Locked(lock) => locks.push(lock),
                                other => return Err(other.into()),
                            }
                        }
                    }
                    other => return Err(other.mismatch(RequestKind::Prewrite)),
                }
            }
            if locks.is_empty() {
                return Ok(());
            }
            // A rejected region request applied nothing, so the whole share
            // is resent; keys already locked by us are accepted again.
            self.inner
                .resolver
                .resolve_or_wait(locks, &mut lock_backoff)
                .await?;
        }
    }

    async fn send(&self, keys: Vec<Key>) -> Result<Vec<Response>> {
        let lock_ttl_ms = self.inner.config.lock_ttl_ms;
        self.inner
            .dispatcher
            .send_batch(keys, |keys| Request::Prewrite {
                mutations: keys
                    .into_iter()
                    .filter_map(|key| {
                        let op = self.mutations.get(&key)?.clone();
                        Some(Mutation { key, op })
                    })
                    .collect(),
                primary: self.primary.clone(),
                start_ts: self.start_ts,
                lock_ttl_ms,
            })
            .await
    }

    fn cancelled() -> Error {
        Error::Aborted {
            reason: "prewrite cancelled after another region failed".into(),
        }
    }
}
