//! GC safe-point registry and the cached checker reads go through.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{SafePointBackend, SafePointConfig};
use crate::error::{Error, Result};
use crate::types::Timestamp;

#[derive(Debug, Error)]
enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::SafePoint(err.to_string())
    }
}

/// Small external key-value registry holding the safe point.
#[async_trait]
pub trait SafePointKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySafePointKv {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySafePointKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SafePointKv for MemorySafePointKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Registry persisted as a JSON object in a single file. Writes go to a
/// sibling temp file first and are renamed over the original.
#[derive(Debug)]
pub struct FileSafePointKv {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileSafePointKv {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = Self::load(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>, PersistenceError> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(PersistenceError::Io(err)),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_vec_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl SafePointKv for FileSafePointKv {
    /// Re-reads the file so writes from other processes become visible.
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        *entries = Self::load(&self.path)?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value);
        if let Err(err) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(err.into());
        }
        Ok(())
    }
}

/// Builds the registry backend named by `config`.
pub fn open_registry(config: &SafePointConfig) -> Result<Arc<dyn SafePointKv>> {
    match config.backend {
        SafePointBackend::Memory => Ok(Arc::new(MemorySafePointKv::new())),
        SafePointBackend::File => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::Config("file safe-point backend needs a path".into()))?;
            Ok(Arc::new(FileSafePointKv::open(path)?))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    safe_point: Timestamp,
    loaded_at: Instant,
}

/// Cached view of the safe point stored under one registry key.
///
/// The value is kept as a decimal string. A missing entry means nothing has
/// been collected yet (safe point zero).
pub struct SafePointCache {
    kv: Arc<dyn SafePointKv>,
    key: String,
    refresh_interval: Duration,
    cached: Mutex<Option<Cached>>,
}

impl SafePointCache {
    pub fn new(kv: Arc<dyn SafePointKv>, config: &SafePointConfig) -> Self {
        Self {
            kv,
            key: config.key.clone(),
            refresh_interval: config.refresh_interval(),
            cached: Mutex::new(None),
        }
    }

    /// Reads the registry, bypassing the cache.
    pub async fn load(&self) -> Result<Timestamp> {
        let safe_point = match self.kv.get(&self.key).await? {
            Some(raw) => parse(&raw)?,
            None => Timestamp::ZERO,
        };
        self.remember(safe_point).await;
        Ok(safe_point)
    }

    /// Safe point, refreshed from the registry when the cached copy is older
    /// than the refresh interval.
    pub async fn current(&self) -> Result<Timestamp> {
        let cached = *self.cached.lock().await;
        match cached {
            Some(cached) if cached.loaded_at.elapsed() < self.refresh_interval => {
                Ok(cached.safe_point)
            }
            _ => self.load().await,
        }
    }

    /// Fails with [`Error::GcExpired`] when `start_ts` is strictly below the
    /// safe point.
    pub async fn check(&self, start_ts: Timestamp) -> Result<()> {
        let safe_point = self.current().await?;
        if start_ts < safe_point {
            return Err(Error::GcExpired {
                start_ts,
                safe_point,
            });
        }
        Ok(())
    }

    /// Advances the stored safe point to `safe_point`. Older values are
    /// ignored; the effective safe point is returned either way.
    pub async fn update(&self, safe_point: Timestamp) -> Result<Timestamp> {
        let current = self.load().await?;
        if safe_point <= current {
            debug!(requested = %safe_point, %current, "safe point not advanced");
            return Ok(current);
        }
        self.kv.put(&self.key, safe_point.version().to_string()).await?;
        self.remember(safe_point).await;
        info!(%safe_point, "safe point advanced");
        Ok(safe_point)
    }

    async fn remember(&self, safe_point: Timestamp) {
        *self.cached.lock().await = Some(Cached {
            safe_point,
            loaded_at: Instant::now(),
        });
    }
}

fn parse(raw: &str) -> Result<Timestamp> {
    raw.trim()
        .parse::<u64>()
        .map(Timestamp::from_version)
        .map_err(|err| Error::SafePoint(format!("malformed safe point {raw:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(version: u64) -> Timestamp {
        Timestamp::from_version(version)
    }

    #[tokio::test]
    async fn check_rejects_reads_below_safe_point() {
        let cache = SafePointCache::new(Arc::new(MemorySafePointKv::new()), &SafePointConfig::memory());
        cache.check(ts(1)).await.expect("no safe point yet");

        cache.update(ts(50)).await.unwrap();
        cache.check(ts(50)).await.expect("equal is still readable");
        let err = cache.check(ts(49)).await.unwrap_err();
        assert!(matches!(err, Error::GcExpired { safe_point, .. } if safe_point == ts(50)));
    }

    #[tokio::test]
    async fn update_only_moves_forward() {
        let kv = Arc::new(MemorySafePointKv::new());
        let cache = SafePointCache::new(kv.clone(), &SafePointConfig::memory());

        assert_eq!(cache.update(ts(80)).await.unwrap(), ts(80));
        assert_eq!(cache.update(ts(20)).await.unwrap(), ts(80));
        assert_eq!(
            kv.get(SafePointConfig::DEFAULT_KEY).await.unwrap().as_deref(),
            Some("80")
        );
    }

    #[tokio::test]
    async fn stale_cache_picks_up_external_updates() {
        let kv = Arc::new(MemorySafePointKv::new());
        let config = SafePointConfig::memory().with_refresh_interval_ms(0);
        let cache = SafePointCache::new(kv.clone(), &config);
        assert_eq!(cache.current().await.unwrap(), Timestamp::ZERO);

        kv.put(&config.key, "300".into()).await.unwrap();
        assert_eq!(cache.current().await.unwrap(), ts(300));
    }

    #[tokio::test]
    async fn malformed_value_is_reported() {
        let kv = Arc::new(MemorySafePointKv::new());
        kv.put(SafePointConfig::DEFAULT_KEY, "yesterday".into()).await.unwrap();
        let cache = SafePointCache::new(kv, &SafePointConfig::memory());
        assert!(matches!(cache.load().await, Err(Error::SafePoint(_))));
    }

    #[tokio::test]
    async fn file_registry_survives_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = SafePointConfig::file(dir.path().join("gc").join("safe_point.json"));

        let cache = SafePointCache::new(open_registry(&config).unwrap(), &config);
        cache.update(ts(1234)).await.unwrap();

        let reopened = SafePointCache::new(open_registry(&config).unwrap(), &config);
        assert_eq!(reopened.load().await.unwrap(), ts(1234));
    }

    #[test]
    fn file_backend_requires_path() {
        let mut config = SafePointConfig::file("unused");
        config.path = None;
        assert!(matches!(open_registry(&config), Err(Error::Config(_))));
    }
}
