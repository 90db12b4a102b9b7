use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::{Error, Result, RetryReason};
use crate::region_cache::RegionCache;
use crate::types::{Key, Region};

use super::message::{RegionError, Request, RequestContext, Response};
use super::{RegionTransport, TransportError};

/// Classified outcome of a single failed attempt. Never leaves this module.
#[derive(Debug)]
enum Failure {
    Retryable(RetryReason),
    Fatal(String),
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Failure::Retryable(RetryReason::Timeout),
            TransportError::Unreachable(_) => Failure::Retryable(RetryReason::Unavailable),
            TransportError::Fatal(reason) => Failure::Fatal(reason),
        }
    }
}

/// Sends region-scoped requests to the current leader, absorbing routing
/// churn and transient faults behind a bounded retry budget.
///
/// Every retryable failure refreshes the region cache before the next
/// attempt, so a retried request is always re-routed from scratch.
pub struct Dispatcher {
    cache: Arc<RegionCache>,
    transport: Arc<dyn RegionTransport>,
    retry: RetryConfig,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<RegionCache>,
        transport: Arc<dyn RegionTransport>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            transport,
            retry,
            timeout,
        }
    }

    pub fn region_cache(&self) -> &Arc<RegionCache> {
        &self.cache
    }

    /// Sends `request` to whichever region owns `key`.
    pub async fn send_to_key(&self, key: &Key, request: Request) -> Result<Response> {
        let mut backoff = Backoff::new(self.retry);
        loop {
            let failure = match self.cache.locate_key(key).await {
                Ok(region) => match self.send_once(&region, request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                },
                Err(err) => err.into(),
            };
            self.back_off(&mut backoff, failure).await?;
        }
    }

    /// Sends one request per owning region for `keys`, built by `build`
    /// from that region's share of the keys.
    ///
    /// A group rejected because the region moved or split is regrouped and
    /// resent on its own; groups that already succeeded are not repeated.
    /// Responses come back in completion order.
    pub async fn send_batch<F>(&self, keys: Vec<Key>, build: F) -> Result<Vec<Response>>
    where
        F: Fn(Vec<Key>) -> Request,
    {
        let mut backoff = Backoff::new(self.retry);
        let mut responses = Vec::new();
        let mut pending = VecDeque::from([keys]);

        while let Some(keys) = pending.pop_front() {
            let groups = match self.cache.group_keys(keys.iter().cloned()).await {
                Ok(groups) => groups,
                Err(err) => {
                    self.back_off(&mut backoff, err.into()).await?;
                    pending.push_front(keys);
                    continue;
                }
            };

            for (region, group) in groups {
                match self.send_once(&region, build(group.clone())).await {
                    Ok(response) => responses.push(response),
                    Err(failure) => {
                        self.back_off(&mut backoff, failure).await?;
                        pending.push_back(group);
                    }
                }
            }
        }
        Ok(responses)
    }

    /// Sends one scan request to the region owning `start`, with the end
    /// bound clipped to that region. `build` receives `(start, clipped_end)`.
    ///
    /// Returns the response together with the region that served it so the
    /// caller can continue from the region boundary.
    pub async fn send_scan<F>(&self, start: &Key, end: &Key, build: F) -> Result<(Response, Arc<Region>)>
    where
        F: Fn(Key, Key) -> Request,
    {
        let mut backoff = Backoff::new(self.retry);
        loop {
            let failure = match self.cache.locate_key(start).await {
                Ok(region) => {
                    let request = build(start.clone(), clip_end(&region, end));
                    match self.send_once(&region, request).await {
                        Ok(response) => return Ok((response, region)),
                        Err(failure) => failure,
                    }
                }
                Err(err) => err.into(),
            };
            self.back_off(&mut backoff, failure).await?;
        }
    }

    async fn send_once(
        &self,
        region: &Region,
        request: Request,
    ) -> std::result::Result<Response, Failure> {
        let Some(leader) = region.leader() else {
            self.cache.invalidate(region.id).await;
            return Err(Failure::Retryable(RetryReason::LeaderChanged));
        };
        let ctx = RequestContext::for_peer(region, leader);

        let outcome = tokio::time::timeout(
            self.timeout,
            self.transport.send(&leader.addr, ctx, request),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(region_err)) => Err(self.on_region_error(region, region_err).await),
            Err(TransportError::Fatal(reason)) => Err(Failure::Fatal(reason)),
            Err(err) => {
                debug!(region_id = region.id, addr = %leader.addr, error = %err, "store did not answer");
                self.cache.invalidate(region.id).await;
                Err(err.into())
            }
        }
    }

    async fn on_region_error(&self, region: &Region, err: RegionError) -> Failure {
        debug!(region_id = region.id, error = ?err, "region rejected request");
        match err {
            RegionError::NotLeader {
                leader: Some(leader),
                ..
            } => {
                self.cache.update_leader(region.id, leader).await;
                Failure::Retryable(RetryReason::LeaderChanged)
            }
            RegionError::NotLeader { leader: None, .. } => {
                self.cache.invalidate(region.id).await;
                Failure::Retryable(RetryReason::LeaderChanged)
            }
            RegionError::EpochNotMatch { .. }
            | RegionError::RegionNotFound { .. }
            | RegionError::KeyNotInRegion { .. } => {
                self.cache.invalidate(region.id).await;
                Failure::Retryable(RetryReason::RegionSplit)
            }
            RegionError::ServerBusy => Failure::Retryable(RetryReason::Unavailable),
            RegionError::Other(reason) => Failure::Fatal(reason),
        }
    }

    async fn back_off(&self, backoff: &mut Backoff, failure: Failure) -> Result<()> {
        match failure {
            Failure::Fatal(reason) => Err(Error::Fatal(reason)),
            Failure::Retryable(reason) => {
                debug!(attempt = backoff.attempts() + 1, %reason, "retrying region request");
                if backoff.wait().await {
                    Ok(())
                } else {
                    Err(Error::RetryExhausted {
                        attempts: backoff.attempts() + 1,
                        reason,
                    })
                }
            }
        }
    }
}

/// Tighter of the requested end and the region end; empty means unbounded.
fn clip_end(region: &Region, end: &Key) -> Key {
    if region.end_key.is_empty() {
        end.clone()
    } else if end.is_empty() || region.end_key < *end {
        region.end_key.clone()
    } else {
        end.clone()
    }
}
