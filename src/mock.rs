//! In-process cluster: timestamp service, routing oracle and region stores
//! sharing one MVCC engine, with hooks for splits, leader moves and faults.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SafePointConfig;
use crate::error::Result;
use crate::oracle::TimestampService;
use crate::region_cache::RoutingOracle;
use crate::rpc::{
    KeyError, RegionError, RegionResult, RegionTransport, Request, RequestContext, RequestKind,
    Response, TransportError,
};
use crate::safepoint::{MemorySafePointKv, SafePointCache, SafePointKv};
use crate::storage::{InMemoryStorage, StorageEngine, StorageError};
use crate::types::{Key, Peer, Region, RegionEpoch, RegionId, StoreId, Timestamp, LOGICAL_BITS};

/// Misbehaviour a region store can be told to exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reject with `NotLeader`, pointing at the real leader.
    NotLeader,
    EpochNotMatch,
    ServerBusy,
    /// Fail the connection before the request is applied.
    Unreachable,
    /// Report a timeout before the request is applied.
    Timeout,
    /// Apply the request, then lose the response.
    LoseResponse,
    /// Stall for the given time before serving normally.
    Delay(Duration),
    /// Unclassified region error.
    Fatal,
}

/// A fault armed for a number of matching requests.
#[derive(Debug, Clone)]
pub struct FaultRule {
    fault: Fault,
    region_id: Option<RegionId>,
    kind: Option<RequestKind>,
    remaining: u32,
}

impl FaultRule {
    /// Fires once on any region and request kind.
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            region_id: None,
            kind: None,
            remaining: 1,
        }
    }

    pub fn on_region(mut self, region_id: RegionId) -> Self {
        self.region_id = Some(region_id);
        self
    }

    pub fn on_request(mut self, kind: RequestKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn times(mut self, count: u32) -> Self {
        self.remaining = count;
        self
    }

    fn matches(&self, ctx: &RequestContext, kind: RequestKind) -> bool {
        self.remaining > 0
            && self.region_id.is_none_or(|id| id == ctx.region_id)
            && self.kind.is_none_or(|k| k == kind)
    }
}

#[derive(Debug, Default)]
struct Tso {
    physical: u64,
    logical: u64,
    failures: u32,
}

#[derive(Debug, Default)]
struct Layout {
    stores: BTreeMap<StoreId, String>,
    regions: BTreeMap<RegionId, Region>,
    next_id: u64,
    faults: Vec<FaultRule>,
}

impl Layout {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn region_containing(&self, key: &Key) -> Option<&Region> {
        self.regions.values().find(|region| region.contains(key))
    }

    fn take_fault(&mut self, ctx: &RequestContext, kind: RequestKind) -> Option<Fault> {
        let rule = self.faults.iter_mut().find(|rule| rule.matches(ctx, kind))?;
        rule.remaining -= 1;
        let fault = rule.fault;
        self.faults.retain(|rule| rule.remaining > 0);
        Some(fault)
    }

    fn validate(&self, ctx: &RequestContext, request: &Request) -> Result<Region, RegionError> {
        let region = self
            .regions
            .get(&ctx.region_id)
            .ok_or(RegionError::RegionNotFound {
                region_id: ctx.region_id,
            })?;
        if region.epoch != ctx.epoch {
            return Err(RegionError::EpochNotMatch {
                region_id: region.id,
            });
        }
        if region.leader().map(|leader| leader.store_id) != Some(ctx.store_id) {
            return Err(RegionError::NotLeader {
                region_id: region.id,
                leader: region.leader.clone(),
            });
        }
        if let Some(key) = request.routed_keys().into_iter().find(|key| !region.contains(key)) {
            return Err(RegionError::KeyNotInRegion {
                key: key.clone(),
                region_id: region.id,
            });
        }
        Ok(region.clone())
    }
}

/// Cluster of region stores living in this process.
///
/// Every store shares one [`InMemoryStorage`]; stores only differ in which
/// regions they lead, which is enough to exercise routing and retries.
///
/// The cluster also owns the safe-point registry. Clients built with
/// [`Backends::mock`](crate::Backends::mock) share it, and region stores
/// refuse reads and prewrites below the value it holds.
pub struct MockCluster {
    storage: Arc<InMemoryStorage>,
    layout: Mutex<Layout>,
    tso: Mutex<Tso>,
    registry: Arc<dyn SafePointKv>,
    safe_point: SafePointCache,
}

impl MockCluster {
    /// One store, one region covering the whole key space.
    pub fn bootstrap_with_single_store() -> Arc<Self> {
        Self::bootstrap_with_stores(1)
    }

    /// `count` stores replicating a single region led by the first store.
    pub fn bootstrap_with_stores(count: usize) -> Arc<Self> {
        let addrs = (1..=count.max(1)).map(|id| format!("mock-store-{id}")).collect();
        Self::bootstrap(addrs)
    }

    /// One store per address, replicating a single region led by the first.
    pub fn bootstrap(store_addrs: Vec<String>) -> Arc<Self> {
        let mut layout = Layout::default();
        let mut peers = Vec::new();
        for addr in store_addrs {
            let store_id = layout.alloc_id();
            let peer_id = layout.alloc_id();
            layout.stores.insert(store_id, addr.clone());
            peers.push(Peer {
                id: peer_id,
                store_id,
                addr,
            });
        }

        let region_id = layout.alloc_id();
        layout.regions.insert(
            region_id,
            Region {
                id: region_id,
                start_key: Key::EMPTY,
                end_key: Key::EMPTY,
                epoch: RegionEpoch {
                    conf_ver: 1,
                    version: 1,
                },
                leader: peers.first().cloned(),
                peers,
            },
        );
        info!(stores = layout.stores.len(), region_id, "bootstrapped mock cluster");

        let registry: Arc<dyn SafePointKv> = Arc::new(MemorySafePointKv::new());
        let safe_point = SafePointCache::new(
            registry.clone(),
            &SafePointConfig::memory().with_refresh_interval_ms(0),
        );
        Arc::new(Self {
            storage: Arc::new(InMemoryStorage::new()),
            layout: Mutex::new(layout),
            tso: Mutex::new(Tso::default()),
            registry,
            safe_point,
        })
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// Safe-point registry shared by every client of this cluster.
    pub fn safe_point_registry(&self) -> Arc<dyn SafePointKv> {
        self.registry.clone()
    }

    /// Current region layout ordered by start key.
    pub async fn regions(&self) -> Vec<Region> {
        let layout = self.layout.lock().await;
        let mut regions: Vec<Region> = layout.regions.values().cloned().collect();
        regions.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        regions
    }

    pub async fn store_ids(&self) -> Vec<StoreId> {
        self.layout.lock().await.stores.keys().copied().collect()
    }

    pub async fn region_for(&self, key: &Key) -> Option<Region> {
        self.layout.lock().await.region_containing(key).cloned()
    }

    /// Splits the region containing `split_key` at that key. The upper half
    /// becomes a new region; both halves get a bumped epoch. Returns the new
    /// region's id, or `None` when `split_key` already starts a region.
    pub async fn split(&self, split_key: impl Into<Key>) -> Option<RegionId> {
        let split_key = split_key.into();
        let mut layout = self.layout.lock().await;
        let original = layout.region_containing(&split_key)?.clone();
        if original.start_key == split_key {
            return None;
        }

        let new_id = layout.alloc_id();
        let epoch = RegionEpoch {
            conf_ver: original.epoch.conf_ver,
            version: original.epoch.version + 1,
        };
        let upper = Region {
            id: new_id,
            start_key: split_key.clone(),
            end_key: original.end_key.clone(),
            epoch,
            peers: original.peers.clone(),
            leader: original.leader.clone(),
        };
        let lower = Region {
            end_key: split_key.clone(),
            epoch,
            ..original
        };
        debug!(region_id = lower.id, new_id, %split_key, "split region");
        layout.regions.insert(lower.id, lower);
        layout.regions.insert(new_id, upper);
        Some(new_id)
    }

    /// Moves leadership of `region_id` to its peer on `store_id`. Returns
    /// false if the region has no peer there.
    pub async fn transfer_leader(&self, region_id: RegionId, store_id: StoreId) -> bool {
        let mut layout = self.layout.lock().await;
        let Some(region) = layout.regions.get_mut(&region_id) else {
            return false;
        };
        let Some(peer) = region.peers.iter().find(|p| p.store_id == store_id).cloned() else {
            return false;
        };
        debug!(region_id, store_id, "transferred leader");
        region.leader = Some(peer);
        true
    }

    pub async fn inject_fault(&self, rule: FaultRule) {
        self.layout.lock().await.faults.push(rule);
    }

    /// Makes the next `count` timestamp requests fail as unreachable.
    pub async fn fail_timestamp_requests(&self, count: u32) {
        self.tso.lock().await.failures = count;
    }

    /// Advances the shared safe point to `safe_point`, then prunes versions
    /// below it. Returns how many records went.
    pub async fn gc(&self, safe_point: Timestamp) -> Result<usize> {
        let effective = self.safe_point.update(safe_point).await?;
        let removed = self.storage.gc(safe_point).await;
        info!(%safe_point, %effective, removed, "mock cluster gc");
        Ok(removed)
    }

    /// Answers reads and prewrites whose version is below the safe point
    /// with `GcExpired` instead of serving them.
    async fn reject_expired(&self, request: &Request) -> Option<Response> {
        let version = match request {
            Request::Get { version, .. }
            | Request::BatchGet { version, .. }
            | Request::Scan { version, .. } => *version,
            Request::Prewrite { start_ts, .. } => *start_ts,
            _ => return None,
        };
        let error = match self.safe_point.load().await {
            Ok(safe_point) if version < safe_point => KeyError::GcExpired {
                start_ts: version,
                safe_point,
            },
            Ok(_) => return None,
            Err(err) => KeyError::Other(err.to_string()),
        };
        debug!(%version, ?error, "rejecting request below safe point");
        let response = match request {
            Request::Get { .. } => Response::Get {
                value: None,
                error: Some(error),
            },
            Request::BatchGet { .. } => Response::BatchGet {
                pairs: Vec::new(),
                errors: vec![error],
            },
            Request::Scan { .. } => Response::Scan {
                pairs: Vec::new(),
                error: Some(error),
            },
            _ => Response::Prewrite {
                errors: vec![error],
            },
        };
        Some(response)
    }

    async fn execute(&self, region: &Region, request: Request) -> RegionResult {
        if let Some(rejected) = self.reject_expired(&request).await {
            return Ok(rejected);
        }
        let storage = &self.storage;
        let response = match request {
            Request::Get { key, version } => match storage.get(&key, version).await {
                Ok(value) => Response::Get { value, error: None },
                Err(err) => Response::Get {
                    value: None,
                    error: Some(single(err)),
                },
            },
            Request::BatchGet { keys, version } => {
                let (pairs, errors) = storage.batch_get(&keys, version).await;
                Response::BatchGet { pairs, errors }
            }
            Request::Scan {
                start_key,
                end_key,
                limit,
                version,
            } => {
                let end_key = if end_key.is_empty() || (!region.end_key.is_empty() && region.end_key < end_key) {
                    region.end_key.clone()
                } else {
                    end_key
                };
                match storage.scan(&start_key, &end_key, limit as usize, version).await {
                    Ok(pairs) => Response::Scan { pairs, error: None },
                    Err(err) => Response::Scan {
                        pairs: Vec::new(),
                        error: Some(single(err)),
                    },
                }
            }
            Request::Prewrite {
                mutations,
                primary,
                start_ts,
                lock_ttl_ms,
            } => Response::Prewrite {
                errors: storage
                    .prewrite(mutations, &primary, start_ts, lock_ttl_ms)
                    .await
                    .err()
                    .map(many)
                    .unwrap_or_default(),
            },
            Request::Commit {
                keys,
                start_ts,
                commit_ts,
            } => Response::Commit {
                error: storage.commit(&keys, start_ts, commit_ts).await.err().map(single),
            },
            Request::BatchRollback { keys, start_ts } => Response::BatchRollback {
                error: storage.rollback(&keys, start_ts).await.err().map(single),
            },
            Request::CheckTxnStatus {
                primary,
                lock_ts,
                current_ts,
                rollback_if_not_exist,
            } => match storage
                .check_txn_status(&primary, lock_ts, current_ts, rollback_if_not_exist)
                .await
            {
                Ok(status) => Response::CheckTxnStatus { status },
                Err(err) => return Err(RegionError::Other(err.to_string())),
            },
            Request::ResolveLock {
                keys,
                start_ts,
                commit_ts,
            } => Response::ResolveLock {
                error: storage.resolve_lock(&keys, start_ts, commit_ts).await.err().map(single),
            },
        };
        Ok(response)
    }
}

fn single(err: StorageError) -> KeyError {
    match err {
        StorageError::Key(err) => err,
        StorageError::Keys(mut errors) => errors
            .pop()
            .unwrap_or_else(|| KeyError::Other("empty key error list".into())),
        StorageError::CorruptedState(reason) => KeyError::Other(reason),
    }
}

fn many(err: StorageError) -> Vec<KeyError> {
    match err {
        StorageError::Keys(errors) => errors,
        other => vec![single(other)],
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl TimestampService for MockCluster {
    async fn allocate_timestamp(&self) -> Result<Timestamp, TransportError> {
        let mut tso = self.tso.lock().await;
        if tso.failures > 0 {
            tso.failures -= 1;
            return Err(TransportError::Unreachable("mock-pd".into()));
        }

        let now = now_ms();
        if now > tso.physical {
            tso.physical = now;
            tso.logical = 0;
        } else {
            tso.logical += 1;
            if tso.logical >= 1 << LOGICAL_BITS {
                tso.physical += 1;
                tso.logical = 0;
            }
        }
        Ok(Timestamp::compose(tso.physical, tso.logical))
    }
}

#[async_trait]
impl RoutingOracle for MockCluster {
    async fn locate_key(&self, key: &Key) -> Result<Region, TransportError> {
        self.region_for(key)
            .await
            .ok_or_else(|| TransportError::Fatal(format!("no region contains key {key}")))
    }
}

#[async_trait]
impl RegionTransport for MockCluster {
    async fn send(
        &self,
        addr: &str,
        ctx: RequestContext,
        request: Request,
    ) -> Result<RegionResult, TransportError> {
        let kind = request.kind();
        let (fault, validated) = {
            let mut layout = self.layout.lock().await;
            if layout.stores.get(&ctx.store_id).map(String::as_str) != Some(addr) {
                return Err(TransportError::Unreachable(addr.to_string()));
            }
            let fault = layout.take_fault(&ctx, kind);
            (fault, layout.validate(&ctx, &request))
        };

        if let Some(fault) = fault {
            debug!(region_id = ctx.region_id, ?kind, ?fault, "injecting fault");
            match fault {
                Fault::NotLeader => {
                    let leader = self
                        .layout
                        .lock()
                        .await
                        .regions
                        .get(&ctx.region_id)
                        .and_then(|region| region.leader.clone());
                    return Ok(Err(RegionError::NotLeader {
                        region_id: ctx.region_id,
                        leader,
                    }));
                }
                Fault::EpochNotMatch => {
                    return Ok(Err(RegionError::EpochNotMatch {
                        region_id: ctx.region_id,
                    }));
                }
                Fault::ServerBusy => return Ok(Err(RegionError::ServerBusy)),
                Fault::Unreachable => return Err(TransportError::Unreachable(addr.to_string())),
                Fault::Timeout => return Err(TransportError::Timeout),
                Fault::Fatal => return Ok(Err(RegionError::Other("injected fatal error".into()))),
                Fault::Delay(delay) => tokio::time::sleep(delay).await,
                Fault::LoseResponse => {
                    if let Ok(region) = &validated {
                        let _ = self.execute(region, request).await;
                    }
                    return Err(TransportError::Unreachable(addr.to_string()));
                }
            }
        }

        match validated {
            Ok(region) => Ok(self.execute(&region, request).await),
            Err(err) => Ok(Err(err)),
        }
    }
}
