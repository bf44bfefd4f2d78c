//! Integration tests for sharing folders, accepting shares and key rotation

mod common;

use std::path::Path;

use ::common::dht::DhtKey;
use ::common::error::ErrorKind;
use ::common::index::PermissionType;
use ::common::process::Outcome;

#[tokio::test]
async fn test_share_and_accept_read() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    alice.upload_folder("photos").await.unwrap();
    let data = alice.upload_random("photos/cat.jpg", 3000).await.unwrap();
    alice.share("photos", "bob", PermissionType::Read).await.unwrap();

    let folder = alice.file_id("photos").await.unwrap();
    assert!(net.dht().contains(&DhtKey::shared_folder("alice", &folder)));

    // alice still sees the whole folder, now shared
    let tree = alice.tree().await.unwrap();
    assert!(tree.is_shared(&folder));
    assert!(tree.can_write(&folder, "alice"));
    assert!(tree.resolve(Path::new("photos/cat.jpg")).is_some());

    assert_eq!(bob.accept_shares().await.unwrap(), Outcome::Applied);
    let tree = bob.tree().await.unwrap();
    let mounted = tree.resolve(Path::new("photos")).unwrap();
    assert_eq!(mounted, folder);
    assert_eq!(
        tree.permission_of(&mounted, "bob"),
        Some(PermissionType::Read)
    );
    let cat = tree.resolve(Path::new("photos/cat.jpg")).unwrap();
    assert!(tree.get(&cat).unwrap().protection_keys().is_none());

    bob.download("photos/cat.jpg").await.unwrap();
    assert_eq!(bob.read_file("photos/cat.jpg").await.unwrap(), data);

    // the inbox is drained
    assert_eq!(bob.accept_shares().await.unwrap(), Outcome::NoOp);
}

#[tokio::test]
async fn test_share_rotates_content_protection() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();

    alice.upload_folder("photos").await.unwrap();
    alice.upload_random("photos/cat.jpg", 3000).await.unwrap();
    let before = alice.session().profile().await.unwrap();
    let own_keys = before.protection_keys().public();
    let file = common::file_index(alice, "photos/cat.jpg").await;
    for key in common::chunk_keys(&file) {
        assert_eq!(net.dht().protection_of(&key), Some(own_keys));
    }

    alice.share("photos", "bob", PermissionType::Read).await.unwrap();
    let profile = alice.session().profile().await.unwrap();
    let folder = profile.resolve(Path::new("photos")).unwrap();
    let mount = profile.mount(&folder).unwrap();
    assert_ne!(mount.protection_public, own_keys);
    for key in common::chunk_keys(&file) {
        assert_eq!(net.dht().protection_of(&key), Some(mount.protection_public));
    }

    // an unknown grantee fails before any key is touched
    let first = mount.protection_public;
    let err = alice
        .share("photos", "nobody", PermissionType::Read)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
    let profile = alice.session().profile().await.unwrap();
    assert_eq!(profile.mount(&folder).unwrap().protection_public, first);
}

#[tokio::test]
async fn test_reshare_adds_writer_and_rotates_keys() {
    let net = common::network(&["alice", "bob", "carol"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();
    let carol = net.peer("carol").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    alice.upload_random("team/plan.md", 1500).await.unwrap();
    let folder = alice.file_id("team").await.unwrap();
    let first = alice.session().profile().await.unwrap().mount(&folder).unwrap().protection_public;

    alice.share("team", "carol", PermissionType::Write).await.unwrap();
    let profile = alice.session().profile().await.unwrap();
    let mount = profile.mount(&folder).unwrap();
    assert_ne!(mount.protection_public, first);
    assert_eq!(mount.members.len(), 3);
    let file = common::file_index(alice, "team/plan.md").await;
    for key in common::chunk_keys(&file) {
        assert_eq!(net.dht().protection_of(&key), Some(mount.protection_public));
    }

    // carol writes, bob reads what she wrote
    carol.accept_shares().await.unwrap();
    bob.accept_shares().await.unwrap();
    let data = carol.upload_random("team/notes.md", 700).await.unwrap();
    bob.download("team/notes.md").await.unwrap();
    assert_eq!(bob.read_file("team/notes.md").await.unwrap(), data);
    assert!(alice
        .tree()
        .await
        .unwrap()
        .resolve(Path::new("team/notes.md"))
        .is_some());
}

#[tokio::test]
async fn test_accepting_mounted_invitations_is_noop() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    let store = bob.session().store();
    let invitation = store.read_inbox().await.unwrap().invitations[0].clone();
    assert_eq!(bob.accept_shares().await.unwrap(), Outcome::Applied);

    // the same invitation again, for a folder bob already has
    assert!(store.post_invitation("bob", invitation).await.unwrap());
    assert_eq!(bob.accept_shares().await.unwrap(), Outcome::NoOp);
    assert!(store.read_inbox().await.unwrap().invitations.is_empty());
    assert_eq!(bob.tree().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reader_cannot_share_or_write() {
    let net = common::network(&["alice", "bob", "carol"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    bob.accept_shares().await.unwrap();

    let err = bob
        .share("team", "carol", PermissionType::Read)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("permission denied"));

    bob.write_random_file("team/intruder.bin", 10).await.unwrap();
    let err = bob
        .session()
        .upload_file("team/intruder.bin")
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_nested_share_rejected() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();

    alice.upload_folder("outer").await.unwrap();
    alice.upload_folder("outer/inner").await.unwrap();
    alice.share("outer", "bob", PermissionType::Read).await.unwrap();

    let err = alice
        .session()
        .share("outer/inner", "bob", PermissionType::Write)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalFileLocation);

    let err = alice
        .session()
        .share("outer", "alice", PermissionType::Write)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalFileLocation);
}

#[tokio::test]
async fn test_accept_renames_on_collision() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    bob.upload_folder("photos").await.unwrap();
    common::shared_folder(alice, "photos", "bob", PermissionType::Read).await;
    bob.accept_shares().await.unwrap();

    let tree = bob.tree().await.unwrap();
    let own = tree.resolve(Path::new("photos")).unwrap();
    let mounted = tree.resolve(Path::new("photos (alice)")).unwrap();
    assert_ne!(own, mounted);
    assert!(tree.get(&mounted).unwrap().shared_link().is_some());
}

#[tokio::test]
async fn test_delete_shared_folder_removes_document() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Read).await;
    alice.upload_random("team/plan.md", 1500).await.unwrap();
    bob.accept_shares().await.unwrap();
    let folder = alice.file_id("team").await.unwrap();
    let file = common::file_index(alice, "team/plan.md").await;

    alice
        .session()
        .run(|session| session.delete("team"))
        .await
        .unwrap();
    assert!(!net.dht().contains(&DhtKey::shared_folder("alice", &folder)));
    for key in common::chunk_keys(&file) {
        assert!(!net.dht().contains(&key));
    }
    assert!(alice
        .tree()
        .await
        .unwrap()
        .resolve(Path::new("team"))
        .is_none());

    // bob keeps an empty, unresolvable placeholder
    let tree = bob.tree().await.unwrap();
    let placeholder = tree.resolve(Path::new("team")).unwrap();
    assert!(tree.children(&placeholder).is_empty());
    assert!(tree.get(&placeholder).unwrap().protection_keys().is_none());
}

#[tokio::test]
async fn test_member_delete_only_unmounts() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", PermissionType::Write).await;
    alice.upload_random("team/plan.md", 1500).await.unwrap();
    bob.accept_shares().await.unwrap();
    let folder = alice.file_id("team").await.unwrap();

    bob.session()
        .run(|session| session.delete("team"))
        .await
        .unwrap();
    assert!(bob
        .tree()
        .await
        .unwrap()
        .resolve(Path::new("team"))
        .is_none());

    // alice's folder and its content are untouched
    assert!(net.dht().contains(&DhtKey::shared_folder("alice", &folder)));
    let file = common::file_index(alice, "team/plan.md").await;
    for key in common::chunk_keys(&file) {
        assert!(net.dht().contains(&key));
    }
}
