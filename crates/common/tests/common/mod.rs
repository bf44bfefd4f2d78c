//! Shared setup for the sync integration tests
#![allow(dead_code)]

use std::path::Path;

use ::common::dht::DhtKey;
use ::common::index::FileIndex;
use ::common::testkit::{TestNetwork, TestPeer};
use tracing_subscriber::EnvFilter;

/// Install a log subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A network with one registered peer per user
pub async fn network(users: &[&str]) -> TestNetwork {
    init_tracing();
    let mut net = TestNetwork::new();
    for user in users {
        net.add_peer(*user).await.unwrap();
    }
    net
}

/// The file index at `path` in `peer`'s current view
pub async fn file_index(peer: &TestPeer, path: &str) -> FileIndex {
    peer.tree()
        .await
        .unwrap()
        .get_by_path(Path::new(path))
        .and_then(|node| node.as_file().cloned())
        .unwrap_or_else(|| panic!("{} has no file at {}", peer.name, path))
}

pub fn chunk_keys(file: &FileIndex) -> Vec<DhtKey> {
    file.chunks.iter().map(|chunk| chunk.key).collect()
}

/// Upload an empty folder and share it
pub async fn shared_folder(
    owner: &TestPeer,
    path: &str,
    grantee: &str,
    permission: ::common::index::PermissionType,
) {
    owner.upload_folder(path).await.unwrap();
    owner.share(path, grantee, permission).await.unwrap();
}
