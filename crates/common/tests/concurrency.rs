//! Integration tests for concurrent writers of one profile

mod common;

use std::path::Path;

use ::common::process::Outcome;
use futures::future::join_all;

#[tokio::test]
async fn test_two_devices_upload_concurrently() {
    let mut net = common::network(&["alice"]).await;
    net.add_device("alice-laptop", "alice").await.unwrap();
    let desktop = net.peer("alice").unwrap();
    let laptop = net.peer("alice-laptop").unwrap();

    desktop.write_random_file("from-desktop.bin", 3000).await.unwrap();
    laptop.write_random_file("from-laptop.bin", 3000).await.unwrap();

    let (a, b) = tokio::join!(
        desktop.session().upload_file("from-desktop.bin").run(),
        laptop.session().upload_file("from-laptop.bin").run(),
    );
    assert_eq!(a.unwrap(), Outcome::Applied);
    assert_eq!(b.unwrap(), Outcome::Applied);

    // no lost update, whoever committed second re-applied on top
    for peer in [desktop, laptop] {
        let tree = peer.tree().await.unwrap();
        assert!(tree.resolve(Path::new("from-desktop.bin")).is_some());
        assert!(tree.resolve(Path::new("from-laptop.bin")).is_some());
    }
}

#[tokio::test]
async fn test_many_concurrent_processes_all_land() {
    let net = common::network(&["alice"]).await;
    let alice = net.peer("alice").unwrap();

    let names: Vec<String> = (0..8).map(|i| format!("folder-{}", i)).collect();
    let runs = names.iter().map(|name| {
        alice
            .session()
            .run(move |session| session.upload_folder(name.clone()))
    });
    for result in join_all(runs).await {
        assert_eq!(result.unwrap(), Outcome::Applied);
    }

    let tree = alice.tree().await.unwrap();
    let root = tree.root_id();
    assert_eq!(tree.children(&root).len(), names.len());
}

#[tokio::test]
async fn test_concurrent_writers_of_a_shared_folder() {
    let net = common::network(&["alice", "bob"]).await;
    let alice = net.peer("alice").unwrap();
    let bob = net.peer("bob").unwrap();

    common::shared_folder(alice, "team", "bob", ::common::index::PermissionType::Write).await;
    bob.accept_shares().await.unwrap();

    alice.write_random_file("team/alice.md", 1200).await.unwrap();
    bob.write_random_file("team/bob.md", 1200).await.unwrap();
    let (a, b) = tokio::join!(
        alice.session().run(|session| session.upload_file("team/alice.md")),
        bob.session().run(|session| session.upload_file("team/bob.md")),
    );
    a.unwrap();
    b.unwrap();

    for peer in [alice, bob] {
        let tree = peer.tree().await.unwrap();
        assert!(tree.resolve(Path::new("team/alice.md")).is_some());
        assert!(tree.resolve(Path::new("team/bob.md")).is_some());
    }
}
