use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::crypto::{KeyPair, PublicKey, Secret, SecretKey};
use crate::dht::Version;
use crate::error::SyncError;
use crate::index::{FileId, IndexTree, SharedLink};

mod document;
mod inbox;
mod register;
mod store;

pub use document::{Inbox, Invitation, MemberShare, SharedFolderDocument};
pub use store::ProfileStore;

const PROFILE_SECRET_CONTEXT: &str = "drift 2026-10 profile secret";

/// What a user logs in with
///
/// The profile secret is derived from all three parts, so a wrong password
/// or pin yields an undecryptable profile rather than a lookup failure.
#[derive(Clone)]
pub struct UserCredentials {
    user_id: String,
    password: String,
    pin: String,
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl UserCredentials {
    pub fn new(
        user_id: impl Into<String>,
        password: impl Into<String>,
        pin: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            pin: pin.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn profile_secret(&self) -> Secret {
        let mut material = Vec::new();
        for part in [&self.user_id, &self.password, &self.pin] {
            material.extend_from_slice(part.as_bytes());
            material.push(0);
        }
        Secret::derive(PROFILE_SECRET_CONTEXT, &material)
    }
}

/// Which DHT document a node's index is persisted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Own,
    Shared(FileId),
}

/// Key material and version of one mounted shared folder
#[derive(Debug, Clone)]
pub struct MountState {
    pub link: SharedLink,
    pub version: Version,
    pub secret: Secret,
    /// `None` for members with read-only access
    pub protection_keys: Option<KeyPair>,
    pub protection_public: PublicKey,
    pub members: BTreeMap<String, MemberShare>,
}

/**
 * UserProfile
 * ===========
 * A resolved view of a user's profile: the own document's tree with
 *  every mounted shared folder spliced in, protection keys assigned
 *  per node, and the version each document was read at.
 * Mutations go through `ProfileStore::commit`, which re-reads this view,
 *  applies a closure to it and writes back the one document the closure
 *  touched.
 */
#[derive(Debug, Clone)]
pub struct UserProfile {
    user_id: String,
    identity: SecretKey,
    protection_keys: KeyPair,
    tree: IndexTree,
    version: Version,
    mounts: BTreeMap<FileId, MountState>,
}

impl UserProfile {
    pub(crate) fn new(
        user_id: String,
        identity: SecretKey,
        protection_keys: KeyPair,
        tree: IndexTree,
        version: Version,
    ) -> Self {
        Self {
            user_id,
            identity,
            protection_keys,
            tree,
            version,
            mounts: BTreeMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn identity(&self) -> &SecretKey {
        &self.identity
    }

    pub fn identity_public(&self) -> PublicKey {
        self.identity.public()
    }

    /// Protection keys of the user's own document and its chunks
    pub fn protection_keys(&self) -> &KeyPair {
        &self.protection_keys
    }

    pub fn tree(&self) -> &IndexTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut IndexTree {
        &mut self.tree
    }

    /// Version of the own document this view was read at
    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn mounts(&self) -> &BTreeMap<FileId, MountState> {
        &self.mounts
    }

    pub fn mount(&self, folder: &FileId) -> Option<&MountState> {
        self.mounts.get(folder)
    }

    pub fn mount_mut(&mut self, folder: &FileId) -> Option<&mut MountState> {
        self.mounts.get_mut(folder)
    }

    pub(crate) fn insert_mount(&mut self, folder: FileId, state: MountState) {
        self.mounts.insert(folder, state);
    }

    pub(crate) fn remove_mount(&mut self, folder: &FileId) -> Option<MountState> {
        self.mounts.remove(folder)
    }

    pub fn resolve(&self, path: &Path) -> Result<FileId, SyncError> {
        self.tree
            .resolve(path)
            .ok_or_else(|| SyncError::NotFound(path.display().to_string()))
    }

    /// The document `id` is persisted in
    pub fn document_of(&self, id: &FileId) -> Document {
        match self.tree.mount_root_of(id) {
            Some(folder) => Document::Shared(folder),
            None => Document::Own,
        }
    }

    /// Protection keys for writes into `document`, if this user holds them
    pub fn keys_for(&self, document: Document) -> Option<&KeyPair> {
        match document {
            Document::Own => Some(&self.protection_keys),
            Document::Shared(folder) => self
                .mounts
                .get(&folder)
                .and_then(|mount| mount.protection_keys.as_ref()),
        }
    }

    /// The own document's tree, with every mount cut back to its placeholder
    pub fn own_document_tree(&self) -> Result<IndexTree, SyncError> {
        let mut tree = self.tree.clone();
        for folder in tree.mount_roots() {
            // a mount nested in another mount is already gone
            if tree.contains(&folder) {
                tree.prune(&folder)?;
                tree.set_permissions(&folder, BTreeMap::new())?;
            }
        }
        Ok(tree)
    }

    /// The subtree persisted in the shared document rooted at `folder`
    pub fn shared_document_tree(&self, folder: &FileId) -> Result<IndexTree, SyncError> {
        let owner = self
            .mounts
            .get(folder)
            .map(|mount| mount.link.owner.clone())
            .ok_or_else(|| SyncError::NotFound(format!("shared folder {:?}", folder)))?;
        Ok(self.tree.subtree(folder, &owner)?)
    }
}
