use std::sync::Arc;

use tessera::rpc::Mutation;
use tessera::storage::StorageEngine;
use tessera::{KvPair, KvStore, MockCluster, RetryConfig, TesseraConfig, Timestamp};

/// Configuration with short retry budgets so failure paths finish quickly.
#[allow(dead_code)]
pub fn fast_config() -> TesseraConfig {
    let mut config = TesseraConfig::default()
        .with_rpc_timeout_ms(500)
        .with_region_retry(RetryConfig::new(8, 1, 10))
        .with_lock_retry(RetryConfig::new(3, 1, 5))
        .with_scan_batch_size(2)
        .with_async_secondary_commit(false);
    config.tso_retry = RetryConfig::new(3, 1, 5);
    config
}

/// A mock cluster together with a client connected to it.
#[allow(dead_code)]
pub struct TestCluster {
    pub cluster: Arc<MockCluster>,
    pub store: KvStore,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(1, fast_config())
    }

    pub fn with_stores(stores: usize) -> Self {
        Self::with_config(stores, fast_config())
    }

    pub fn with_config(stores: usize, config: TesseraConfig) -> Self {
        let cluster = MockCluster::bootstrap_with_stores(stores);
        let store = KvStore::with_mock(&cluster, config);
        Self { cluster, store }
    }

    /// A second, independent client (own caches) over the same cluster.
    pub fn another_client(&self) -> KvStore {
        KvStore::with_mock(&self.cluster, fast_config())
    }

    /// Splits the key space at every key in order.
    pub async fn split_at(&self, keys: &[&str]) {
        for key in keys {
            self.cluster.split(*key).await.expect("split");
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Timestamp {
        let mut txn = self.store.begin().await.expect("begin");
        txn.set(key, value).expect("set");
        txn.commit()
            .await
            .expect("commit")
            .commit_ts
            .expect("write transaction has a commit ts")
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let txn = self.store.begin().await.expect("begin");
        txn.get(key).await.expect("get")
    }

    pub async fn scan_all(&self) -> Vec<KvPair> {
        let txn = self.store.begin().await.expect("begin");
        txn.iter("", "")
            .await
            .expect("iter")
            .collect_pairs()
            .await
            .expect("scan")
    }

    /// Leaves a lock on every key as if a transaction prewrote them and then
    /// vanished. The first key is the primary.
    pub async fn abandon_prewrite(&self, keys: &[&str], ttl_ms: u64) -> Timestamp {
        let start_ts = self.store.current_timestamp().await.expect("timestamp");
        let mutations = keys
            .iter()
            .map(|key| Mutation::put(*key, format!("abandoned-{key}")))
            .collect();
        self.cluster
            .storage()
            .prewrite(mutations, &keys[0].into(), start_ts, ttl_ms)
            .await
            .expect("prewrite");
        start_ts
    }
}

/// Deletes every visible key with one transaction.
#[allow(dead_code)]
pub async fn clear_storage(store: &KvStore) {
    let mut txn = store.begin().await.expect("begin");
    let keys: Vec<_> = txn
        .iter("", "")
        .await
        .expect("iter")
        .collect_pairs()
        .await
        .expect("scan")
        .into_iter()
        .map(|pair| pair.key)
        .collect();
    for key in keys {
        txn.delete(key).expect("delete");
    }
    txn.commit().await.expect("commit clear");
}

#[allow(dead_code)]
pub fn pairs(items: &[(&str, &str)]) -> Vec<KvPair> {
    items
        .iter()
        .map(|(key, value)| KvPair::new(*key, value.as_bytes().to_vec()))
        .collect()
}
