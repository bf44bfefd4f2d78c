//! Integration tests for failure, rollback, cancellation and listeners

mod common;

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use ::common::dht::DhtKey;
use ::common::error::{ErrorKind, SyncError};
use ::common::index::PermissionType;
use ::common::process::{Outcome, ProcessState};
use ::common::testkit::TestListener;

#[tokio::test]
async fn test_failed_commit_leaves_no_chunks() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();
    alice.write_random_file("big.bin", 3000).await.unwrap();
    let before: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();

    // three chunk puts go through, the profile write and its retries fail
    let retries = net.config().io_retries as usize;
    net.dht().fail_puts_after(3, retries + 1);

    let process = alice.session().upload_file("big.bin");
    let listener = TestListener::new();
    process.listen(listener.clone());
    let handle = process.handle();
    let err = process.run().await.unwrap_err();
    net.dht().clear_faults();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert_eq!(handle.state(), ProcessState::RolledBack);
    assert_eq!(listener.failed(), 1);
    assert_eq!(listener.succeeded(), 0);
    assert_eq!(listener.rolled_back(), 1);
    let report = listener.report().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.rolled_back, vec!["put chunks", "validate upload"]);

    let after: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();
    assert_eq!(before, after);
    assert!(alice
        .tree()
        .await
        .unwrap()
        .resolve(Path::new("big.bin"))
        .is_none());
}

#[tokio::test]
async fn test_failed_chunk_put_leaves_nothing() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();
    alice.write_random_file("big.bin", 5000).await.unwrap();
    let before: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();

    // the third chunk never makes it
    let retries = net.config().io_retries as usize;
    net.dht().fail_puts_after(2, retries + 1);
    let err = alice
        .session()
        .upload_file("big.bin")
        .run()
        .await
        .unwrap_err();
    net.dht().clear_faults();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    let after: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_failed_share_restores_protection() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    alice.upload_folder("team").await.unwrap();
    alice.upload_random("team/plan.md", 2500).await.unwrap();
    let own_keys = alice
        .session()
        .profile()
        .await
        .unwrap()
        .protection_keys()
        .public();
    let chunks = common::chunk_keys(&common::file_index(alice, "team/plan.md").await);
    let tree_before = alice.tree().await.unwrap();
    let folder = alice.file_id("team").await.unwrap();

    // re-protecting is not a put; publishing the document is
    let retries = net.config().io_retries as usize;
    net.dht().fail_puts_after(0, retries + 1);
    let err = alice
        .session()
        .share("team", "bob", PermissionType::Read)
        .run()
        .await
        .unwrap_err();
    net.dht().clear_faults();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    for key in &chunks {
        assert_eq!(net.dht().protection_of(key), Some(own_keys));
    }
    assert!(!net.dht().contains(&DhtKey::shared_folder("alice", &folder)));
    assert_eq!(alice.tree().await.unwrap(), tree_before);
    assert_eq!(bob.accept_shares().await.unwrap(), Outcome::NoOp);
}

#[tokio::test]
async fn test_failed_move_into_shared_folder_restores_content() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    let data = alice.upload_random("doc.bin", 2500).await.unwrap();
    let own_keys = alice
        .session()
        .profile()
        .await
        .unwrap()
        .protection_keys()
        .public();
    let chunks = common::chunk_keys(&common::file_index(alice, "doc.bin").await);
    let tree_before = alice.tree().await.unwrap();
    let keys_before: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();

    // the chunks rebind and the detach commits, the graft never lands
    let retries = net.config().io_retries as usize;
    net.dht().fail_puts_after(1, retries + 1);
    let process = alice.session().move_node("doc.bin", "team/doc.bin");
    let listener = TestListener::new();
    process.listen(listener.clone());
    let err = process.run().await.unwrap_err();
    net.dht().clear_faults();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    let report = listener.report().unwrap();
    assert!(report.is_clean());
    assert_eq!(
        report.rolled_back,
        vec!["commit detach from source", "re-protect content", "validate move"]
    );
    assert_eq!(alice.tree().await.unwrap(), tree_before);
    for key in &chunks {
        assert_eq!(net.dht().protection_of(key), Some(own_keys));
    }
    let keys_after: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();
    assert_eq!(keys_before, keys_after);

    bob.accept_shares().await.unwrap();
    assert!(bob
        .tree()
        .await
        .unwrap()
        .resolve(Path::new("team/doc.bin"))
        .is_none());
    alice.download("doc.bin").await.unwrap();
    assert_eq!(alice.read_file("doc.bin").await.unwrap(), data);
}

#[tokio::test]
async fn test_failed_shared_folder_delete_restores_everything() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    let data = alice.upload_random("team/plan.md", 2500).await.unwrap();
    let folder = alice.file_id("team").await.unwrap();
    let share_keys = alice
        .session()
        .profile()
        .await
        .unwrap()
        .mount(&folder)
        .unwrap()
        .protection_public;
    let chunks = common::chunk_keys(&common::file_index(alice, "team/plan.md").await);
    let tree_before = alice.tree().await.unwrap();
    let keys_before: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();

    // every chunk goes, removing the shared document fails
    let retries = net.config().io_retries as usize;
    net.dht().fail_removes_after(chunks.len(), retries + 1);
    let process = alice.session().delete("team");
    let listener = TestListener::new();
    process.listen(listener.clone());
    let err = process.run().await.unwrap_err();
    net.dht().clear_faults();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    let report = listener.report().unwrap();
    assert!(report.is_clean());
    assert_eq!(
        report.rolled_back,
        vec!["remove content", "commit remove", "validate delete"]
    );
    assert_eq!(alice.tree().await.unwrap(), tree_before);
    for key in &chunks {
        assert_eq!(net.dht().protection_of(key), Some(share_keys));
    }
    let keys_after: BTreeSet<DhtKey> = net.dht().live_keys().into_iter().collect();
    assert_eq!(keys_before, keys_after);
    assert!(net.dht().contains(&DhtKey::shared_folder("alice", &folder)));

    // bob can still mount and read it
    bob.accept_shares().await.unwrap();
    bob.download("team/plan.md").await.unwrap();
    assert_eq!(bob.read_file("team/plan.md").await.unwrap(), data);
}

#[tokio::test]
async fn test_cancel_before_first_step() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();
    let puts = net.dht().put_count();

    let process = alice.session().upload_folder("never");
    let handle = process.handle();
    let listener = TestListener::new();
    handle.listen(listener.clone());
    handle.cancel();

    let err = process.run().await.unwrap_err();
    assert_eq!(err, SyncError::Cancelled);
    assert!(handle.is_done());
    assert_eq!(listener.terminal(), 1);
    assert_eq!(listener.error(), Some(SyncError::Cancelled));
    assert_eq!(net.dht().put_count(), puts);
}

#[tokio::test]
async fn test_started_process_notifies_listeners_once() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();
    alice.write_random_file("a.bin", 2000).await.unwrap();

    let early = TestListener::new();
    let process = alice.session().upload_file("a.bin");
    process.listen(early.clone());
    let handle = process.start();

    let outcome = handle
        .wait_till_succeeded(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert!(handle.is_done());

    // attached after the fact, replayed once
    let late = TestListener::new();
    handle.listen(late.clone());
    for listener in [&early, &late] {
        assert_eq!(listener.terminal(), 1);
        assert_eq!(listener.succeeded(), 1);
        assert_eq!(listener.outcome(), Some(Outcome::Applied));
        assert_eq!(listener.rolled_back(), 0);
    }
}

#[tokio::test]
async fn test_wait_till_failed() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();

    let handle = alice.session().delete("missing.bin").start();
    let err = handle.wait_till_failed(Duration::from_secs(5)).await.unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(handle.state(), ProcessState::RolledBack);
    assert!(handle
        .wait_till_succeeded(Duration::from_millis(10))
        .await
        .is_none());
}
