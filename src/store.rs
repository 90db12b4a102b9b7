use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::TesseraConfig;
use crate::error::Result;
use crate::lock_resolver::LockResolver;
use crate::mock::MockCluster;
use crate::oracle::{Oracle, TimestampService};
use crate::region_cache::{RegionCache, RoutingOracle};
use crate::rpc::grpc::{GrpcTransport, PdGrpcClient};
use crate::rpc::{Dispatcher, RegionTransport};
use crate::safepoint::{self, SafePointCache, SafePointKv};
use crate::snapshot::Snapshot;
use crate::transaction::Transaction;
use crate::types::Timestamp;

/// The pluggable services a store talks to.
#[derive(Clone)]
pub struct Backends {
    pub tso: Arc<dyn TimestampService>,
    pub routing: Arc<dyn RoutingOracle>,
    pub transport: Arc<dyn RegionTransport>,
    pub safe_point: Arc<dyn SafePointKv>,
}

impl Backends {
    /// Every service backed by one in-process cluster, including the
    /// cluster's safe-point registry.
    pub fn mock(cluster: &Arc<MockCluster>) -> Self {
        Self {
            tso: cluster.clone(),
            routing: cluster.clone(),
            transport: cluster.clone(),
            safe_point: cluster.safe_point_registry(),
        }
    }
}

/// Shared client state: everything a transaction or snapshot needs.
pub(crate) struct StoreInner {
    pub(crate) uuid: String,
    pub(crate) config: TesseraConfig,
    pub(crate) oracle: Arc<Oracle>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) resolver: Arc<LockResolver>,
    pub(crate) safe_point: Arc<SafePointCache>,
}

/// Entry point of the client. Cheap to clone; clones share caches.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<StoreInner>,
}

impl KvStore {
    pub fn new(uuid: impl Into<String>, backends: Backends, config: TesseraConfig) -> Self {
        let oracle = Arc::new(Oracle::new(
            backends.tso,
            config.tso_retry,
            config.rpc_timeout(),
        ));
        let cache = Arc::new(RegionCache::new(backends.routing));
        let dispatcher = Arc::new(Dispatcher::new(
            cache,
            backends.transport,
            config.region_retry,
            config.rpc_timeout(),
        ));
        let resolver = Arc::new(LockResolver::new(dispatcher.clone(), oracle.clone()));
        let safe_point = Arc::new(SafePointCache::new(backends.safe_point, &config.safe_point));

        Self {
            inner: Arc::new(StoreInner {
                uuid: uuid.into(),
                config,
                oracle,
                dispatcher,
                resolver,
                safe_point,
            }),
        }
    }

    /// Store with a freshly generated identifier.
    pub fn open(backends: Backends, config: TesseraConfig) -> Self {
        Self::new(Uuid::new_v4().to_string(), backends, config)
    }

    /// Store over an in-process cluster.
    pub fn with_mock(cluster: &Arc<MockCluster>, config: TesseraConfig) -> Self {
        Self::open(Backends::mock(cluster), config)
    }

    /// Connects to the coordination service at `config.pd_endpoints` over
    /// gRPC and talks to region stores at the addresses it reports.
    pub async fn connect(config: TesseraConfig) -> Result<Self> {
        let pd = Arc::new(PdGrpcClient::connect(&config.pd_endpoints).await?);
        let safe_point = safepoint::open_registry(&config.safe_point)?;
        let backends = Backends {
            tso: pd.clone(),
            routing: pd,
            transport: Arc::new(GrpcTransport::new()),
            safe_point,
        };
        let store = Self::open(backends, config);
        info!(uuid = %store.uuid(), endpoints = ?store.inner.config.pd_endpoints, "connected");
        Ok(store)
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.inner.config
    }

    pub fn region_cache(&self) -> &Arc<RegionCache> {
        self.inner.dispatcher.region_cache()
    }

    /// Starts a transaction at a fresh timestamp.
    pub async fn begin(&self) -> Result<Transaction> {
        let start_ts = self.inner.oracle.get_timestamp().await?;
        Ok(self.begin_with_start_ts(start_ts))
    }

    /// Starts a transaction at a caller-chosen timestamp.
    pub fn begin_with_start_ts(&self, start_ts: Timestamp) -> Transaction {
        Transaction::new(Arc::clone(&self.inner), start_ts)
    }

    /// Read-only view as of `ts`.
    pub fn snapshot(&self, ts: Timestamp) -> Snapshot {
        Snapshot::new(Arc::clone(&self.inner), ts)
    }

    pub async fn current_timestamp(&self) -> Result<Timestamp> {
        self.inner.oracle.get_timestamp().await
    }

    /// Current GC safe point as stored in the registry.
    pub async fn safe_point(&self) -> Result<Timestamp> {
        self.inner.safe_point.load().await
    }

    /// Advances the GC safe point; never moves it backwards. Returns the
    /// effective safe point.
    pub async fn update_safe_point(&self, safe_point: Timestamp) -> Result<Timestamp> {
        self.inner.safe_point.update(safe_point).await
    }
}
