#[path = "common.rs"]
mod common;

use common::TestCluster;
use tessera::rpc::RequestKind;
use tessera::storage::{StorageEngine, WriteKind};
use tessera::{ConflictReason, Error, Fault, FaultRule, Key};

#[tokio::test(flavor = "multi_thread")]
async fn reader_rolls_forward_committed_secondary() {
    let test = TestCluster::new();
    let start_ts = test.abandon_prewrite(&["p", "s"], 60_000).await;
    let commit_ts = test.store.current_timestamp().await.unwrap();
    // Only the primary made it before the writer vanished.
    test.cluster
        .storage()
        .commit(&[Key::from("p")], start_ts, commit_ts)
        .await
        .unwrap();

    assert_eq!(test.get("s").await.as_deref(), Some(&b"abandoned-s"[..]));
    assert!(test.cluster.storage().locks().await.is_empty());
    let records = test.cluster.storage().write_records(&Key::from("s")).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].commit_ts, commit_ts);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_lock_is_rolled_back() {
    let test = TestCluster::new();
    test.put("s", "committed").await;
    test.abandon_prewrite(&["p", "s"], 0).await;

    assert_eq!(test.get("s").await.as_deref(), Some(&b"committed"[..]));
    assert!(test.get("p").await.is_none());
    assert!(test.cluster.storage().locks().await.is_empty());

    let primary = test.cluster.storage().write_records(&Key::from("p")).await;
    assert!(matches!(primary.last().map(|r| &r.kind), Some(WriteKind::Rollback)));
}

#[tokio::test(flavor = "multi_thread")]
async fn live_lock_surfaces_as_conflict() {
    let test = TestCluster::new();
    let holder = test.abandon_prewrite(&["k"], 60_000).await;

    let txn = test.store.begin().await.unwrap();
    match txn.get("k").await.unwrap_err() {
        Error::Conflict {
            key,
            reason: ConflictReason::Locked { holder_start_ts },
        } => {
            assert_eq!(key, Key::from("k"));
            assert_eq!(holder_start_ts, holder);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // A reader never touches a live lock.
    assert_eq!(test.cluster.storage().locks().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn writer_resolves_expired_lock_before_prewrite() {
    let test = TestCluster::new();
    test.abandon_prewrite(&["a", "b"], 0).await;

    let mut txn = test.store.begin().await.unwrap();
    txn.set("b", "fresh").unwrap();
    txn.commit().await.unwrap();

    assert_eq!(test.get("b").await.as_deref(), Some(&b"fresh"[..]));
    assert!(test.cluster.storage().locks().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_resolvers_agree() {
    let test = TestCluster::new();
    test.abandon_prewrite(&["p", "x", "y", "z"], 0).await;

    let mut readers = Vec::new();
    for key in ["x", "y", "z", "p"] {
        let client = test.another_client();
        readers.push(tokio::spawn(async move {
            let txn = client.begin().await.unwrap();
            txn.get(key).await
        }));
    }
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), None);
    }
    assert!(test.cluster.storage().locks().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_commit_ack_still_succeeds() {
    let test = TestCluster::new();
    test.cluster
        .inject_fault(FaultRule::new(Fault::LoseResponse).on_request(RequestKind::Commit))
        .await;

    let mut txn = test.store.begin().await.unwrap();
    txn.set("k", "v").unwrap();
    let receipt = txn.commit().await.unwrap();
    assert!(receipt.commit_ts.is_some());
    assert_eq!(test.get("k").await.as_deref(), Some(&b"v"[..]));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_primary_is_settled_by_rollback() {
    let test = TestCluster::new();
    // The first commit attempt is applied but never acknowledged; every
    // retry after that fails, so only the settling rollback can tell.
    test.cluster
        .inject_fault(FaultRule::new(Fault::LoseResponse).on_request(RequestKind::Commit))
        .await;
    test.cluster
        .inject_fault(
            FaultRule::new(Fault::Unreachable)
                .on_request(RequestKind::Commit)
                .times(100),
        )
        .await;

    let mut txn = test.store.begin().await.unwrap();
    txn.set("k", "v").unwrap();
    txn.commit().await.unwrap();
    assert_eq!(test.get("k").await.as_deref(), Some(&b"v"[..]));
}

#[tokio::test(flavor = "multi_thread")]
async fn primary_never_reached_aborts_cleanly() {
    let test = TestCluster::new();
    test.cluster
        .inject_fault(
            FaultRule::new(Fault::Unreachable)
                .on_request(RequestKind::Commit)
                .times(100),
        )
        .await;

    let mut txn = test.store.begin().await.unwrap();
    txn.set("k", "v").unwrap();
    txn.set("l", "w").unwrap();
    assert!(matches!(txn.commit().await, Err(Error::Aborted { .. })));
    assert!(test.get("k").await.is_none());
    assert!(test.cluster.storage().locks().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_outcome_undetermined_when_primary_stays_dark() {
    let test = TestCluster::new();
    for kind in [RequestKind::Commit, RequestKind::Rollback] {
        test.cluster
            .inject_fault(FaultRule::new(Fault::Unreachable).on_request(kind).times(100))
            .await;
    }

    let mut txn = test.store.begin().await.unwrap();
    txn.set("k", "v").unwrap();
    assert!(matches!(
        txn.commit().await,
        Err(Error::Undetermined { .. })
    ));
}
