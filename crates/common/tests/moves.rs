//! Integration tests for moving and renaming, inside and across documents

mod common;

use std::path::Path;

use ::common::error::ErrorKind;
use ::common::index::PermissionType;
use ::common::process::Outcome;

#[tokio::test]
async fn test_rename_within_own_tree() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();

    alice.upload_folder("docs").await.unwrap();
    alice.upload_random("a.bin", 1500).await.unwrap();
    let id = alice.file_id("a.bin").await.unwrap();
    let chunks = common::chunk_keys(&common::file_index(alice, "a.bin").await);

    alice
        .session()
        .run(|session| session.move_node("a.bin", "docs/b.bin"))
        .await
        .unwrap();

    let tree = alice.tree().await.unwrap();
    assert!(tree.resolve(Path::new("a.bin")).is_none());
    assert_eq!(tree.resolve(Path::new("docs/b.bin")), Some(id));
    // same document, the content is not touched
    assert_eq!(
        common::chunk_keys(&common::file_index(alice, "docs/b.bin").await),
        chunks
    );
}

#[tokio::test]
async fn test_invalid_destinations() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();

    alice.upload_folder("docs").await.unwrap();
    alice.upload_folder("docs/sub").await.unwrap();
    alice.upload_random("a.bin", 10).await.unwrap();
    alice.upload_random("docs/a.bin", 10).await.unwrap();

    let err = alice
        .session()
        .move_node("docs", "docs/sub/docs")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalFileLocation);

    let err = alice
        .session()
        .move_node("a.bin", "docs/a.bin")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = alice
        .session()
        .move_node("a.bin", "a.bin/inside")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalFileLocation);

    let err = alice
        .session()
        .move_node("missing.bin", "b.bin")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_move_into_shared_folder_rotates_keys() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    let data = alice.upload_random("doc.bin", 2500).await.unwrap();
    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    bob.accept_shares().await.unwrap();

    let profile = alice.session().profile().await.unwrap();
    let own_keys = profile.protection_keys().public();
    let folder = profile.resolve(Path::new("team")).unwrap();
    let team_keys = profile.mount(&folder).unwrap().protection_public;
    let chunks = common::chunk_keys(&common::file_index(alice, "doc.bin").await);
    for key in &chunks {
        assert_eq!(net.dht().protection_of(key), Some(own_keys));
    }

    alice
        .session()
        .run(|session| session.move_node("doc.bin", "team/doc.bin"))
        .await
        .unwrap();
    for key in &chunks {
        assert_eq!(net.dht().protection_of(key), Some(team_keys));
    }
    let tree = alice.tree().await.unwrap();
    assert!(tree.resolve(Path::new("doc.bin")).is_none());
    let moved = tree.resolve(Path::new("team/doc.bin")).unwrap();
    assert_eq!(
        tree.get(&moved).unwrap().protection_keys().map(|keys| keys.public()),
        Some(team_keys)
    );

    // the reader sees it without any protection keys
    let tree = bob.tree().await.unwrap();
    let seen = tree.resolve(Path::new("team/doc.bin")).unwrap();
    assert!(tree.get(&seen).unwrap().protection_keys().is_none());
    assert_eq!(tree.permission_of(&seen, "bob"), Some(PermissionType::Read));
    bob.download("team/doc.bin").await.unwrap();
    assert_eq!(bob.read_file("team/doc.bin").await.unwrap(), data);

    // and back out again
    alice
        .session()
        .run(|session| session.move_node("team/doc.bin", "doc.bin"))
        .await
        .unwrap();
    for key in &chunks {
        assert_eq!(net.dht().protection_of(key), Some(own_keys));
    }
    assert!(bob
        .tree()
        .await
        .unwrap()
        .resolve(Path::new("team/doc.bin"))
        .is_none());
}

#[tokio::test]
async fn test_reader_cannot_move() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    alice.upload_random("team/plan.md", 800).await.unwrap();
    bob.accept_shares().await.unwrap();
    bob.upload_random("mine.bin", 100).await.unwrap();

    let alice_before = alice.tree().await.unwrap();
    let bob_before = bob.tree().await.unwrap();
    let puts = net.dht().put_count();

    // within the shared folder
    let err = bob
        .session()
        .move_node("team/plan.md", "team/plan-v2.md")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // out of it
    let err = bob
        .session()
        .move_node("team/plan.md", "plan.md")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // into it
    let err = bob
        .session()
        .move_node("mine.bin", "team/mine.bin")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalFileLocation);

    // the mount itself
    let err = bob
        .session()
        .move_node("team", "renamed")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    assert_eq!(net.dht().put_count(), puts);
    assert_eq!(alice.tree().await.unwrap(), alice_before);
    assert_eq!(bob.tree().await.unwrap(), bob_before);
}

#[tokio::test]
async fn test_writer_moves_inside_shared_folder() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Write).await;
    alice.upload_folder("team/drafts").await.unwrap();
    alice.upload_random("team/plan.md", 800).await.unwrap();
    bob.accept_shares().await.unwrap();

    bob.session()
        .run(|session| session.move_node("team/plan.md", "team/drafts/plan.md"))
        .await
        .unwrap();

    let tree = alice.tree().await.unwrap();
    assert!(tree.resolve(Path::new("team/plan.md")).is_none());
    assert!(tree.resolve(Path::new("team/drafts/plan.md")).is_some());
}

#[tokio::test]
async fn test_permissions_inherit_from_share_root() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    alice.upload_folder("team/deep").await.unwrap();
    alice.upload_random("team/deep/file.bin", 10).await.unwrap();
    alice.upload_random("private.bin", 10).await.unwrap();
    bob.accept_shares().await.unwrap();

    let tree = alice.tree().await.unwrap();
    let deep = tree.resolve(Path::new("team/deep/file.bin")).unwrap();
    let private = tree.resolve(Path::new("private.bin")).unwrap();
    assert_eq!(tree.permission_of(&deep, "alice"), Some(PermissionType::Write));
    assert_eq!(tree.permission_of(&deep, "bob"), Some(PermissionType::Read));
    assert!(tree.is_shared(&deep));
    assert_eq!(tree.permission_of(&private, "bob"), None);
    assert!(!tree.is_shared(&private));

    let tree = bob.tree().await.unwrap();
    let deep = tree.resolve(Path::new("team/deep/file.bin")).unwrap();
    assert_eq!(tree.permission_of(&deep, "bob"), Some(PermissionType::Read));
    assert!(!tree.can_write(&deep, "bob"));
}

/// bob follows a move alice made inside the folder she shared with him
async fn moved_under_bob(net: &::common::testkit::TestNetwork) -> Vec<u8> {
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    alice.upload_folder("team/sub").await.unwrap();
    let data = alice.upload_random("team/a.bin", 1500).await.unwrap();
    bob.accept_shares().await.unwrap();
    bob.session().synchronize().await.unwrap().run().await.unwrap();
    assert_eq!(bob.read_file("team/a.bin").await.unwrap(), data);

    alice
        .session()
        .run(|session| session.move_node("team/a.bin", "team/sub/a.bin"))
        .await
        .unwrap();
    data
}

#[tokio::test]
async fn test_synchronize_follows_remote_move() {
    let net = common::network(&["alice", "bob"]).await;
    let bob = net.peer("bob").unwrap();
    let data = moved_under_bob(&net).await;

    let outcome = bob.session().synchronize().await.unwrap().run().await.unwrap();
    assert_eq!(outcome, Outcome::Applied);
    assert!(!bob.local_path("team/a.bin").exists());
    assert_eq!(bob.read_file("team/sub/a.bin").await.unwrap(), data);

    let outcome = bob.session().synchronize().await.unwrap().run().await.unwrap();
    assert_eq!(outcome, Outcome::NoOp);
}

#[tokio::test]
async fn test_failed_synchronize_restores_stale_files() {
    let net = common::network(&["alice", "bob"]).await;
    let bob = net.peer("bob").unwrap();
    let data = moved_under_bob(&net).await;

    let process = bob.session().synchronize().await.unwrap();
    net.dht().set_offline(true);
    let err = process.run().await.unwrap_err();
    net.dht().set_offline(false);
    assert_eq!(err.kind(), ErrorKind::ProfileUnavailable);

    assert_eq!(bob.read_file("team/a.bin").await.unwrap(), data);
    assert!(!bob.local_path("team/sub/a.bin").exists());
    assert!(bob.local_path("team/sub").is_dir());
}
