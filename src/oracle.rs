//! Timestamp oracle client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::rpc::TransportError;
use crate::types::Timestamp;

/// Cluster coordination service that hands out globally ordered timestamps.
#[async_trait]
pub trait TimestampService: Send + Sync {
    async fn allocate_timestamp(&self) -> Result<Timestamp, TransportError>;
}

/// Client side of the timestamp service: adds a per-call deadline, bounded
/// retries and a record of the newest value seen.
pub struct Oracle {
    service: Arc<dyn TimestampService>,
    retry: RetryConfig,
    timeout: Duration,
    last_seen: AtomicU64,
}

impl Oracle {
    pub fn new(service: Arc<dyn TimestampService>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            service,
            retry,
            timeout,
            last_seen: AtomicU64::new(0),
        }
    }

    /// Fetches a fresh timestamp, retrying transient failures.
    ///
    /// A value not newer than one already handed out before the call began
    /// (say, from a lagging endpoint after failover) is retried like a
    /// transient failure. Fails with [`Error::Unavailable`] once the retry
    /// budget is spent.
    pub async fn get_timestamp(&self) -> Result<Timestamp> {
        let mut backoff = Backoff::new(self.retry);
        loop {
            let floor = self.last_seen();
            let err = match tokio::time::timeout(self.timeout, self.service.allocate_timestamp())
                .await
            {
                Ok(Ok(ts)) if ts == Timestamp::ZERO => {
                    return Err(Error::Fatal("timestamp service returned zero".into()));
                }
                Ok(Ok(ts)) if ts <= floor => {
                    warn!(%ts, last_seen = %floor, "timestamp service went backwards");
                    format!("timestamp {ts} is not newer than {floor}")
                }
                Ok(Ok(ts)) => {
                    self.last_seen.fetch_max(ts.version(), Ordering::AcqRel);
                    return Ok(ts);
                }
                Ok(Err(TransportError::Fatal(reason))) => return Err(Error::Fatal(reason)),
                Ok(Err(err)) => err.to_string(),
                Err(_) => TransportError::Timeout.to_string(),
            };

            debug!(attempt = backoff.attempts(), error = %err, "timestamp allocation failed");
            if !backoff.wait().await {
                warn!(attempts = backoff.attempts() + 1, error = %err, "giving up on timestamp service");
                return Err(Error::Unavailable(format!(
                    "{err} after {} attempts",
                    backoff.attempts() + 1
                )));
            }
        }
    }

    /// Newest timestamp this client has handed out, or zero before the first call.
    pub fn last_seen(&self) -> Timestamp {
        Timestamp::from_version(self.last_seen.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Fails the first `failures` calls, then counts upward.
    struct FlakyService {
        failures: AtomicU32,
        next: AtomicU64,
    }

    impl FlakyService {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                next: AtomicU64::new(100),
            }
        }
    }

    #[async_trait]
    impl TimestampService for FlakyService {
        async fn allocate_timestamp(&self) -> Result<Timestamp, TransportError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Unreachable("pd".into()));
            }
            Ok(Timestamp::from_version(
                self.next.fetch_add(1, Ordering::SeqCst),
            ))
        }
    }

    fn oracle(service: FlakyService, attempts: u32) -> Oracle {
        Oracle::new(
            Arc::new(service),
            RetryConfig::new(attempts, 0, 0),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let oracle = oracle(FlakyService::new(2), 3);
        let first = oracle.get_timestamp().await.expect("timestamp after retries");
        let second = oracle.get_timestamp().await.expect("second timestamp");
        assert!(second > first);
        assert_eq!(oracle.last_seen(), second);
    }

    /// Replays a fixed sequence of versions, repeating the last one.
    struct ScriptedService {
        versions: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl TimestampService for ScriptedService {
        async fn allocate_timestamp(&self) -> Result<Timestamp, TransportError> {
            let mut versions = self.versions.lock().unwrap();
            let version = if versions.len() > 1 {
                versions.remove(0)
            } else {
                versions[0]
            };
            Ok(Timestamp::from_version(version))
        }
    }

    fn scripted(versions: Vec<u64>, attempts: u32) -> Oracle {
        Oracle::new(
            Arc::new(ScriptedService {
                versions: std::sync::Mutex::new(versions),
            }),
            RetryConfig::new(attempts, 0, 0),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn backwards_timestamp_is_retried() {
        let oracle = scripted(vec![500, 300, 500, 501], 3);
        assert_eq!(oracle.get_timestamp().await.unwrap().version(), 500);
        assert_eq!(oracle.get_timestamp().await.unwrap().version(), 501);
        assert_eq!(oracle.last_seen().version(), 501);
    }

    #[tokio::test]
    async fn stuck_timestamp_service_is_unavailable() {
        let oracle = scripted(vec![700, 200], 2);
        oracle.get_timestamp().await.unwrap();
        let err = oracle.get_timestamp().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "unexpected error {err:?}");
        assert_eq!(oracle.last_seen().version(), 700);
    }

    #[tokio::test]
    async fn sustained_failure_is_unavailable() {
        let oracle = oracle(FlakyService::new(10), 2);
        let err = oracle.get_timestamp().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "unexpected error {err:?}");
    }
}
