use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Client-wide configuration.
///
/// Every field has a default so a JSON file only needs to name what it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TesseraConfig {
    /// Coordination-service replicas answering timestamp and routing requests.
    pub pd_endpoints: Vec<String>,
    /// Deadline applied to each individual RPC.
    pub rpc_timeout_ms: u64,
    /// Backoff budget for leader moves, splits, timeouts and unreachable stores.
    pub region_retry: RetryConfig,
    /// Backoff budget for timestamp allocation.
    pub tso_retry: RetryConfig,
    /// Backoff budget while waiting for a live foreign lock to be released.
    pub lock_retry: RetryConfig,
    /// TTL carried by every prewrite lock. A lock older than this may be
    /// rolled back by any transaction that trips over it.
    pub lock_ttl_ms: u64,
    /// Pairs fetched per scan RPC.
    pub scan_batch_size: u32,
    /// Commit secondary keys on a background task once the primary is durable.
    pub async_secondary_commit: bool,
    pub txn_limits: TxnLimits,
    pub safe_point: SafePointConfig,
}

impl TesseraConfig {
    pub fn new(pd_endpoints: Vec<String>) -> Self {
        Self {
            pd_endpoints,
            ..Self::default()
        }
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| Error::Config(format!("parse {}: {err}", path.display())))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn with_lock_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.lock_ttl_ms = ttl_ms;
        self
    }

    pub fn with_rpc_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    pub fn with_region_retry(mut self, retry: RetryConfig) -> Self {
        self.region_retry = retry;
        self
    }

    pub fn with_lock_retry(mut self, retry: RetryConfig) -> Self {
        self.lock_retry = retry;
        self
    }

    pub fn with_scan_batch_size(mut self, batch_size: u32) -> Self {
        self.scan_batch_size = batch_size.max(1);
        self
    }

    pub fn with_async_secondary_commit(mut self, enabled: bool) -> Self {
        self.async_secondary_commit = enabled;
        self
    }

    pub fn with_txn_limits(mut self, limits: TxnLimits) -> Self {
        self.txn_limits = limits;
        self
    }

    pub fn with_safe_point(mut self, safe_point: SafePointConfig) -> Self {
        self.safe_point = safe_point;
        self
    }
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            pd_endpoints: vec!["127.0.0.1:2379".into()],
            rpc_timeout_ms: 2_000,
            region_retry: RetryConfig::new(10, 2, 500),
            tso_retry: RetryConfig::new(6, 10, 1_000),
            lock_retry: RetryConfig::new(12, 5, 400),
            lock_ttl_ms: 3_000,
            scan_batch_size: 256,
            async_secondary_commit: true,
            txn_limits: TxnLimits::default(),
            safe_point: SafePointConfig::memory(),
        }
    }
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Budget that gives up on the first failure.
    pub fn no_retry() -> Self {
        Self::new(0, 0, 0)
    }
}

/// Local write-buffer constraints checked by `set`/`delete`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnLimits {
    pub max_entry_size: usize,
    pub max_entries: usize,
}

impl Default for TxnLimits {
    fn default() -> Self {
        Self {
            max_entry_size: 6 * 1024 * 1024,
            max_entries: 300_000,
        }
    }
}

/// Supported safe-point registry backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SafePointBackend {
    Memory,
    File,
}

/// Where the GC safe point lives and how often the cached copy is refreshed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafePointConfig {
    pub backend: SafePointBackend,
    pub path: Option<PathBuf>,
    pub key: String,
    pub refresh_interval_ms: u64,
}

impl SafePointConfig {
    pub const DEFAULT_KEY: &'static str = "/tessera/gc/saved_safe_point";

    pub fn memory() -> Self {
        Self {
            backend: SafePointBackend::Memory,
            path: None,
            key: Self::DEFAULT_KEY.into(),
            refresh_interval_ms: 1_000,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: SafePointBackend::File,
            path: Some(path.into()),
            ..Self::memory()
        }
    }

    pub fn with_refresh_interval_ms(mut self, interval_ms: u64) -> Self {
        self.refresh_interval_ms = interval_ms;
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tessera.json");
        fs::write(
            &path,
            br#"{"pd_endpoints": ["10.0.0.1:2379", "10.0.0.2:2379"], "lock_ttl_ms": 750}"#,
        )
        .expect("write config");

        let config = TesseraConfig::load(&path).expect("load config");
        assert_eq!(config.pd_endpoints.len(), 2);
        assert_eq!(config.lock_ttl_ms, 750);
        assert_eq!(config.scan_batch_size, TesseraConfig::default().scan_batch_size);
        assert_eq!(config.safe_point, SafePointConfig::memory());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{ not json").expect("write config");

        let err = TesseraConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
