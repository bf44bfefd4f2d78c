//! Synchronization processes
//!
//! Every user-facing operation is a [`Process`](crate::process::Process)
//! composed from the steps in these modules. The shape is always the same:
//! read the profile and validate locally, do the content work, commit the
//! tree mutation through [`ProfileStore::commit`], and undo in reverse if
//! anything fails. Content actions run before the commit when access to
//! the content grows, and after it when access shrinks.
//!
//! Paths handed to the builders are relative to the sync root.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::crypto::KeyPair;
use crate::dht::{DhtStore, RetryPolicy};
use crate::error::SyncError;
use crate::index::{FileId, IndexTree};
use crate::profile::ProfileStore;

pub mod content;
pub mod delete;
pub mod download;
pub mod events;
pub mod relocate;
pub mod share;
pub mod upload;

pub use events::{EventDispatcher, EventReceiver, FileEvent};

/// What every step needs: the user's store and the local sync root
#[derive(Debug, Clone)]
pub struct SyncContext {
    store: ProfileStore,
    root: PathBuf,
}

impl SyncContext {
    pub fn new(store: ProfileStore, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn dht(&self) -> &Arc<dyn DhtStore> {
        self.store.dht()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.store.retry()
    }

    pub fn config(&self) -> &SyncConfig {
        self.store.config()
    }

    pub fn user_id(&self) -> &str {
        self.store.user_id()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a tree path lives on disk
    pub fn local_path(&self, path: &Path) -> PathBuf {
        let mut local = self.root.clone();
        for component in path.components() {
            if let Component::Normal(name) = component {
                local.push(name);
            }
        }
        local
    }

    /// The tree path of an absolute local path
    pub fn tree_path(&self, local: &Path) -> Result<PathBuf, SyncError> {
        local
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                SyncError::IllegalFileLocation(format!(
                    "{} is outside the sync root {}",
                    local.display(),
                    self.root.display()
                ))
            })
    }
}

/// Split a tree path into its parent path and final name
pub(crate) fn split_path(path: &Path) -> Result<(PathBuf, String), SyncError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            SyncError::IllegalFileLocation(format!("{} has no file name", path.display()))
        })?;
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((parent, name.to_string()))
}

pub(crate) fn require_write(tree: &IndexTree, id: &FileId, user_id: &str) -> Result<(), SyncError> {
    if tree.can_write(id, user_id) {
        return Ok(());
    }
    Err(SyncError::PermissionDenied(format!(
        "{} cannot write {}",
        user_id,
        describe(tree, id)
    )))
}

/// The protection keys that guard `id`'s content
pub(crate) fn keys_of(tree: &IndexTree, id: &FileId, user_id: &str) -> Result<KeyPair, SyncError> {
    tree.get(id)
        .and_then(|node| node.protection_keys())
        .cloned()
        .ok_or_else(|| {
            SyncError::PermissionDenied(format!(
                "{} holds no protection keys for {}",
                user_id,
                describe(tree, id)
            ))
        })
}

pub(crate) fn describe(tree: &IndexTree, id: &FileId) -> String {
    match tree.path_of(id) {
        Some(path) => format!("/{}", path.display()),
        None => format!("{:?}", id),
    }
}
