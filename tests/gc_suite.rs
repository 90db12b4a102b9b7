#[path = "common.rs"]
mod common;

use common::{TestCluster, fast_config};
use tessera::{Backends, Error, KvStore, SafePointConfig, Timestamp};

/// A second client whose cached safe point stays stale for the whole test.
fn lagging_client(test: &TestCluster) -> KvStore {
    let safe_point = SafePointConfig::memory().with_refresh_interval_ms(60_000);
    KvStore::with_mock(&test.cluster, fast_config().with_safe_point(safe_point))
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_below_safe_point_is_rejected() {
    let test = TestCluster::new();
    test.put("k", "v1").await;
    let old = test.store.begin().await.unwrap();
    test.put("k", "v2").await;
    assert_eq!(old.get("k").await.unwrap().as_deref(), Some(&b"v1"[..]));

    let now = test.store.current_timestamp().await.unwrap();
    assert_eq!(test.store.update_safe_point(now).await.unwrap(), now);
    let removed = test.cluster.gc(now).await.unwrap();
    assert_eq!(removed, 1);

    match old.get("k").await.unwrap_err() {
        Error::GcExpired {
            start_ts,
            safe_point,
        } => {
            assert_eq!(start_ts, old.start_ts());
            assert_eq!(safe_point, now);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(old.batch_get(["k"]).await, Err(Error::GcExpired { .. })));
    assert!(matches!(old.iter("", "").await, Err(Error::GcExpired { .. })));

    // Fresh transactions are unaffected and see the surviving version.
    assert_eq!(test.get("k").await.as_deref(), Some(&b"v2"[..]));
}

#[tokio::test(flavor = "multi_thread")]
async fn safe_point_only_moves_forward() {
    let test = TestCluster::new();
    assert_eq!(test.store.safe_point().await.unwrap(), Timestamp::ZERO);

    let high = test.store.current_timestamp().await.unwrap();
    let low = Timestamp::from_version(high.version() / 2);
    assert_eq!(test.store.update_safe_point(high).await.unwrap(), high);
    assert_eq!(test.store.update_safe_point(low).await.unwrap(), high);
    assert_eq!(test.store.safe_point().await.unwrap(), high);
}

#[tokio::test(flavor = "multi_thread")]
async fn scan_checks_safe_point_per_batch() {
    let test = TestCluster::new();
    for key in ["a", "b", "c", "d", "e"] {
        test.put(key, "v").await;
    }

    let txn = test.store.begin().await.unwrap();
    let mut iter = txn.iter("", "").await.unwrap();
    iter.next().await.unwrap();
    assert!(iter.valid());

    let now = test.store.current_timestamp().await.unwrap();
    test.store.update_safe_point(now).await.unwrap();

    // The remaining buffered pair is served; the next fetch is refused.
    let mut outcome = Ok(());
    while iter.valid() && outcome.is_ok() {
        outcome = iter.next().await;
    }
    assert!(matches!(outcome, Err(Error::GcExpired { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn file_registry_is_shared_between_clients() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("safe_point.json");
    let test = TestCluster::new();

    let registry_config = SafePointConfig::file(&path).with_refresh_interval_ms(0);
    let open_client = || {
        let registry = tessera::safepoint::open_registry(&registry_config).expect("registry");
        let backends = Backends {
            safe_point: registry,
            ..Backends::mock(&test.cluster)
        };
        KvStore::open(backends, fast_config().with_safe_point(registry_config.clone()))
    };
    let writer = open_client();
    let reader = open_client();

    let old = reader.begin().await.unwrap();
    let now = writer.current_timestamp().await.unwrap();
    writer.update_safe_point(now).await.unwrap();

    assert_eq!(reader.safe_point().await.unwrap(), now);
    assert!(matches!(old.get("k").await, Err(Error::GcExpired { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn gc_is_visible_to_every_client_of_the_cluster() {
    let test = TestCluster::new();
    test.put("k", "v1").await;
    let other = test.another_client();
    let old = other.begin().await.unwrap();
    test.put("k", "v2").await;

    let now = test.store.current_timestamp().await.unwrap();
    test.store.update_safe_point(now).await.unwrap();
    test.cluster.gc(now).await.unwrap();

    assert_eq!(other.safe_point().await.unwrap(), now);
    match old.get("k").await {
        Err(Error::GcExpired { start_ts, safe_point }) => {
            assert_eq!(start_ts, old.start_ts());
            assert_eq!(safe_point, now);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stores_refuse_reads_behind_a_stale_cached_safe_point() {
    let test = TestCluster::new();
    test.put("j", "v1").await;
    test.put("k", "v1").await;
    let other = lagging_client(&test);
    let old = other.begin().await.unwrap();
    // Caches "no safe point yet" on the lagging client.
    assert_eq!(old.get("k").await.unwrap().as_deref(), Some(&b"v1"[..]));
    test.put("k", "v2").await;

    let now = test.store.current_timestamp().await.unwrap();
    test.cluster.gc(now).await.unwrap();

    assert!(matches!(old.get("k").await, Err(Error::GcExpired { .. })));
    assert!(matches!(old.batch_get(["j", "k"]).await, Err(Error::GcExpired { .. })));
    assert!(matches!(old.iter("", "").await, Err(Error::GcExpired { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_started_below_safe_point_is_rejected() {
    let test = TestCluster::new();
    test.put("k", "v1").await;
    let mut old = test.store.begin().await.unwrap();

    let mut deleter = test.store.begin().await.unwrap();
    deleter.delete("k").unwrap();
    deleter.commit().await.unwrap();

    let now = test.store.current_timestamp().await.unwrap();
    test.store.update_safe_point(now).await.unwrap();
    test.cluster.gc(now).await.unwrap();

    old.set("k", "lost-update").unwrap();
    let err = old.commit().await.unwrap_err();
    assert!(matches!(err, Error::GcExpired { .. }), "unexpected error {err:?}");
    assert!(err.is_retryable_txn());
    assert!(test.get("k").await.is_none());
    assert!(test.cluster.storage().locks().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stores_refuse_prewrite_behind_a_stale_cached_safe_point() {
    let test = TestCluster::new();
    test.put("k", "v1").await;
    let other = lagging_client(&test);
    let mut old = other.begin().await.unwrap();
    assert!(old.get("k").await.unwrap().is_some());

    let mut deleter = test.store.begin().await.unwrap();
    deleter.delete("k").unwrap();
    deleter.commit().await.unwrap();

    let now = test.store.current_timestamp().await.unwrap();
    test.cluster.gc(now).await.unwrap();

    old.set("k", "lost-update").unwrap();
    assert!(matches!(old.commit().await, Err(Error::GcExpired { .. })));
    assert!(test.get("k").await.is_none());
    assert!(test.cluster.storage().locks().await.is_empty());
}
