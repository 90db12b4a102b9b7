//! Region router: key → region lookups backed by a lazily filled cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::rpc::TransportError;
use crate::types::{Key, Peer, Region, RegionId};

/// External service that knows which region currently owns a key.
#[async_trait]
pub trait RoutingOracle: Send + Sync {
    async fn locate_key(&self, key: &Key) -> Result<Region, TransportError>;
}

/// Cached view of the region layout.
///
/// Entries are immutable `Arc<Region>` snapshots indexed by start key. A
/// refresh swaps in a new descriptor and evicts every cached region that
/// overlaps it, so readers holding an older `Arc` keep a consistent (if
/// stale) picture until their next RPC tells them otherwise.
pub struct RegionCache {
    oracle: Arc<dyn RoutingOracle>,
    regions: RwLock<BTreeMap<Key, Arc<Region>>>,
}

impl RegionCache {
    pub fn new(oracle: Arc<dyn RoutingOracle>) -> Self {
        Self {
            oracle,
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Region owning `key`, served from cache when possible.
    pub async fn locate_key(&self, key: &Key) -> Result<Arc<Region>, TransportError> {
        if let Some(region) = self.cached(key).await {
            return Ok(region);
        }
        self.load(key).await
    }

    /// Ordered regions covering `[start, end)`. An empty `end` runs to the
    /// end of the key space.
    pub async fn locate_range(
        &self,
        start: &Key,
        end: &Key,
    ) -> Result<Vec<Arc<Region>>, TransportError> {
        let mut regions = Vec::new();
        if !end.is_empty() && start >= end {
            return Ok(regions);
        }

        let mut cursor = start.clone();
        loop {
            let region = self.locate_key(&cursor).await?;
            let covers_rest =
                region.end_key.is_empty() || (!end.is_empty() && region.end_key >= *end);
            cursor = region.end_key.clone();
            regions.push(region);
            if covers_rest {
                return Ok(regions);
            }
        }
    }

    /// Partitions `keys` by owning region. Keys come back sorted, and groups
    /// are ordered by region start key.
    pub async fn group_keys(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> Result<Vec<(Arc<Region>, Vec<Key>)>, TransportError> {
        let mut keys: Vec<Key> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut groups: Vec<(Arc<Region>, Vec<Key>)> = Vec::new();
        for key in keys {
            match groups.last_mut() {
                Some((region, members)) if region.contains(&key) => members.push(key),
                _ => {
                    let region = self.locate_key(&key).await?;
                    groups.push((region, vec![key]));
                }
            }
        }
        Ok(groups)
    }

    /// Drops the cached descriptor for `region_id`; the next lookup asks the
    /// routing oracle again.
    pub async fn invalidate(&self, region_id: RegionId) {
        let mut regions = self.regions.write().await;
        regions.retain(|_, region| region.id != region_id);
        debug!(region_id, "region cache entry invalidated");
    }

    /// Records a leader hint from a `NotLeader` rejection. Hints naming a
    /// peer the cached descriptor does not know drop the entry instead.
    pub async fn update_leader(&self, region_id: RegionId, leader: Peer) {
        let mut regions = self.regions.write().await;
        let Some((start_key, region)) = regions
            .iter()
            .find(|(_, region)| region.id == region_id)
            .map(|(start_key, region)| (start_key.clone(), Arc::clone(region)))
        else {
            return;
        };

        if region.peers.iter().any(|peer| peer.store_id == leader.store_id) {
            debug!(region_id, store_id = leader.store_id, "switching cached leader");
            regions.insert(start_key, Arc::new(region.with_leader(leader)));
        } else {
            regions.remove(&start_key);
        }
    }

    /// Snapshot of every cached descriptor in key order.
    pub async fn cached_regions(&self) -> Vec<Arc<Region>> {
        self.regions.read().await.values().cloned().collect()
    }

    async fn cached(&self, key: &Key) -> Option<Arc<Region>> {
        let regions = self.regions.read().await;
        regions
            .range(..=key.clone())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(key))
            .cloned()
    }

    async fn load(&self, key: &Key) -> Result<Arc<Region>, TransportError> {
        let region = Arc::new(self.oracle.locate_key(key).await?);
        if !region.contains(key) {
            return Err(TransportError::Fatal(format!(
                "routing oracle returned region {} which does not contain key {key}",
                region.id
            )));
        }

        let mut regions = self.regions.write().await;
        regions.retain(|_, cached| !cached.overlaps(&region));
        regions.insert(region.start_key.clone(), Arc::clone(&region));
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;
    use crate::types::RegionEpoch;

    struct StaticRouting {
        layout: Mutex<Vec<Region>>,
        lookups: AtomicUsize,
    }

    impl StaticRouting {
        fn new(layout: Vec<Region>) -> Self {
            Self {
                layout: Mutex::new(layout),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RoutingOracle for StaticRouting {
        async fn locate_key(&self, key: &Key) -> Result<Region, TransportError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let layout = self.layout.lock().await;
            layout
                .iter()
                .find(|region| region.contains(key))
                .cloned()
                .ok_or_else(|| TransportError::Fatal("no region".into()))
        }
    }

    fn peer(store_id: u64) -> Peer {
        Peer {
            id: store_id,
            store_id,
            addr: format!("store-{store_id}"),
        }
    }

    fn region(id: RegionId, start: &str, end: &str, version: u64) -> Region {
        Region {
            id,
            start_key: start.into(),
            end_key: end.into(),
            epoch: RegionEpoch {
                conf_ver: 1,
                version,
            },
            peers: vec![peer(1), peer(2)],
            leader: Some(peer(1)),
        }
    }

    #[tokio::test]
    async fn cached_lookup_avoids_oracle() {
        let routing = Arc::new(StaticRouting::new(vec![
            region(1, "", "m", 1),
            region(2, "m", "", 1),
        ]));
        let cache = RegionCache::new(routing.clone());

        assert_eq!(cache.locate_key(&"a".into()).await.unwrap().id, 1);
        assert_eq!(cache.locate_key(&"b".into()).await.unwrap().id, 1);
        assert_eq!(cache.locate_key(&"x".into()).await.unwrap().id, 2);
        assert_eq!(routing.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn range_and_grouping_follow_region_boundaries() {
        let routing = Arc::new(StaticRouting::new(vec![
            region(1, "", "c", 1),
            region(2, "c", "f", 1),
            region(3, "f", "", 1),
        ]));
        let cache = RegionCache::new(routing);

        let ids: Vec<RegionId> = cache
            .locate_range(&"b".into(), &"d".into())
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let groups = cache
            .group_keys(vec!["g".into(), "a".into(), "d".into(), "b".into()])
            .await
            .unwrap();
        let shape: Vec<(RegionId, usize)> = groups.iter().map(|(r, k)| (r.id, k.len())).collect();
        assert_eq!(shape, vec![(1, 2), (2, 1), (3, 1)]);
    }

    #[tokio::test]
    async fn refresh_after_split_replaces_overlapping_entries() {
        let routing = Arc::new(StaticRouting::new(vec![region(1, "", "", 1)]));
        let cache = RegionCache::new(routing.clone());
        assert_eq!(cache.locate_key(&"q".into()).await.unwrap().id, 1);

        *routing.layout.lock().await = vec![region(1, "", "k", 2), region(7, "k", "", 2)];
        cache.invalidate(1).await;

        assert_eq!(cache.locate_key(&"q".into()).await.unwrap().id, 7);
        assert_eq!(cache.locate_key(&"a".into()).await.unwrap().id, 1);
        assert_eq!(cache.cached_regions().await.len(), 2);
    }

    #[tokio::test]
    async fn leader_hint_updates_or_evicts() {
        let routing = Arc::new(StaticRouting::new(vec![region(1, "", "", 1)]));
        let cache = RegionCache::new(routing.clone());
        cache.locate_key(&"a".into()).await.unwrap();

        cache.update_leader(1, peer(2)).await;
        let region = cache.locate_key(&"a".into()).await.unwrap();
        assert_eq!(region.leader().map(|p| p.store_id), Some(2));
        assert_eq!(routing.lookups.load(Ordering::SeqCst), 1);

        cache.update_leader(1, peer(9)).await;
        assert!(cache.cached_regions().await.is_empty());
    }
}
