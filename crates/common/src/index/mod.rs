#![allow(clippy::doc_lazy_continuation)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{ContentHash, KeyPair, PublicKey, Secret, SecretKey};
use crate::dht::DhtKey;

mod tree;

pub use tree::IndexTree;

/**
 * Index
 * =====
 * One node of a user's file tree snapshot. Nodes live in an arena
 *  (`IndexTree`) keyed by their file id; a folder owns its children
 *  by id and a child points back at its parent by id only.
 * Every node is named by the public half of a freshly generated
 *  keypair, so ids are stable across moves and unique across users.
 * A node's content-protection keypair is never encoded: it is filled
 *  in when the tree is resolved, from whichever document the node
 *  lives in, and is `None` for users with read-only access.
 */

/// Identity of an index node in the DHT namespace
pub type FileId = PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionType {
    Read,
    Write,
}

/// A user's access level at some node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserPermission {
    pub user_id: String,
    pub permission: PermissionType,
}

impl UserPermission {
    pub fn new(user_id: impl Into<String>, permission: PermissionType) -> Self {
        Self {
            user_id: user_id.into(),
            permission,
        }
    }
}

/// One encrypted chunk of a file's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Where the ciphertext lives
    pub key: DhtKey,
    /// Decrypts exactly this chunk
    pub secret: Secret,
    /// Plaintext length
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileIndex {
    pub size: u64,
    pub content_hash: ContentHash,
    /// In content order
    pub chunks: Vec<ChunkRef>,
}

/// Points a folder at the shared-folder document holding its subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLink {
    pub owner: String,
    pub folder: FileId,
}

impl SharedLink {
    pub fn document_key(&self) -> DhtKey {
        DhtKey::shared_folder(&self.owner, &self.folder)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderIndex {
    /// Ordered by name; names are unique among siblings
    children: BTreeMap<String, FileId>,
    /// Set on the root folder of a shared-folder document
    link: Option<SharedLink>,
}

impl FolderIndex {
    pub fn children(&self) -> &BTreeMap<String, FileId> {
        &self.children
    }

    pub fn link(&self) -> Option<&SharedLink> {
        self.link.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexKind {
    File(FileIndex),
    Folder(FolderIndex),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    id: FileId,
    parent: Option<FileId>,
    name: String,
    /// Explicit permissions set where a share was initiated
    permissions: BTreeMap<String, PermissionType>,
    #[serde(skip)]
    protection_keys: Option<KeyPair>,
    kind: IndexKind,
}

impl Index {
    fn new(id: FileId, name: impl Into<String>, kind: IndexKind) -> Self {
        Self {
            id,
            parent: None,
            name: name.into(),
            permissions: BTreeMap::new(),
            protection_keys: None,
            kind,
        }
    }

    fn fresh_id() -> FileId {
        SecretKey::generate().public()
    }

    pub fn file(name: impl Into<String>, file: FileIndex) -> Self {
        Self::new(Self::fresh_id(), name, IndexKind::File(file))
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self::folder_with_id(Self::fresh_id(), name)
    }

    /// A folder with a known id, e.g. a placeholder for a mounted share
    pub fn folder_with_id(id: FileId, name: impl Into<String>) -> Self {
        Self::new(id, name, IndexKind::Folder(FolderIndex::default()))
    }

    /* Getters */

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn parent(&self) -> Option<FileId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &IndexKind {
        &self.kind
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, IndexKind::Folder(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, IndexKind::File(_))
    }

    pub fn as_file(&self) -> Option<&FileIndex> {
        match &self.kind {
            IndexKind::File(file) => Some(file),
            IndexKind::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&FolderIndex> {
        match &self.kind {
            IndexKind::Folder(folder) => Some(folder),
            IndexKind::File(_) => None,
        }
    }

    pub fn shared_link(&self) -> Option<&SharedLink> {
        self.as_folder().and_then(|folder| folder.link())
    }

    pub fn explicit_permissions(&self) -> &BTreeMap<String, PermissionType> {
        &self.permissions
    }

    pub fn protection_keys(&self) -> Option<&KeyPair> {
        self.protection_keys.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is not a folder")]
    NotAFolder(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("cannot move '{from}' to '{to}': destination is inside source")]
    MoveIntoSelf { from: String, to: String },
    #[error("the root folder cannot be moved or removed")]
    RootImmutable,
    #[error("malformed tree: {0}")]
    Malformed(String),
}
