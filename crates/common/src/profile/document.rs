use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::BlockEncoded;
use crate::crypto::{KeyPair, PublicKey, Secret, SecretKey, SecretShare};
use crate::error::SyncError;
use crate::index::{FileId, IndexTree, PermissionType, SharedLink};

/// Plaintext of a user's own profile document
///
/// Stored encrypted under the credentials-derived secret. Shared folders
/// appear in `tree` only as empty placeholder folders carrying a link.
#[derive(Serialize, Deserialize)]
pub(crate) struct ProfileBody {
    pub user_id: String,
    pub identity: SecretKey,
    pub protection: SecretKey,
    pub tree: IndexTree,
}

impl BlockEncoded for ProfileBody {
    const KIND: &'static str = "profile";
}

/// One member's entry in a shared folder header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberShare {
    pub permission: PermissionType,
    /// The document secret, wrapped for the member's identity key
    pub secret: SecretShare,
    /// The protection private key, wrapped for writers only
    pub protection: Option<SecretShare>,
}

impl MemberShare {
    pub fn new(
        permission: PermissionType,
        secret: &Secret,
        protection_keys: &KeyPair,
        recipient: &PublicKey,
    ) -> Result<Self, SyncError> {
        let protection = match permission {
            PermissionType::Write => Some(SecretShare::for_keypair(protection_keys, recipient)?),
            PermissionType::Read => None,
        };
        Ok(Self {
            permission,
            secret: SecretShare::new(secret, recipient)?,
            protection,
        })
    }
}

/// A shared folder's subtree and the key material its members need
///
/// The header is readable by anyone who can fetch the entry; the subtree
/// body is only readable with the document secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFolderDocument {
    pub folder: FileId,
    pub owner: String,
    pub protection: PublicKey,
    pub members: BTreeMap<String, MemberShare>,
    body: Vec<u8>,
}

impl BlockEncoded for SharedFolderDocument {
    const KIND: &'static str = "shared folder document";
}

impl SharedFolderDocument {
    /// Encrypt `subtree` into a document for `link`
    pub fn seal(
        link: &SharedLink,
        protection: PublicKey,
        members: BTreeMap<String, MemberShare>,
        secret: &Secret,
        subtree: &IndexTree,
    ) -> Result<Self, SyncError> {
        if subtree.root_id() != link.folder {
            return Err(SyncError::Codec(format!(
                "subtree root {:?} is not the shared folder {:?}",
                subtree.root_id(),
                link.folder
            )));
        }
        Ok(Self {
            folder: link.folder,
            owner: link.owner.clone(),
            protection,
            members,
            body: secret.encrypt(&subtree.encode()?)?,
        })
    }

    pub fn link(&self) -> SharedLink {
        SharedLink {
            owner: self.owner.clone(),
            folder: self.folder,
        }
    }

    /// Recover the document secret, the protection keys (writers only) and
    ///  the subtree as `user_id`
    pub fn open(
        &self,
        user_id: &str,
        identity: &SecretKey,
    ) -> Result<(Secret, Option<KeyPair>, IndexTree), SyncError> {
        let member = self.members.get(user_id).ok_or_else(|| {
            SyncError::PermissionDenied(format!(
                "{} is not a member of shared folder {:?}",
                user_id, self.folder
            ))
        })?;
        let secret = member.secret.recover(identity)?;
        let protection_keys = member
            .protection
            .as_ref()
            .map(|share| share.recover_keypair(identity))
            .transpose()?;
        let subtree = IndexTree::decode(&secret.decrypt(&self.body)?)?;
        if subtree.root_id() != self.folder {
            return Err(SyncError::Codec(format!(
                "shared folder {:?} holds a foreign subtree",
                self.folder
            )));
        }
        Ok((secret, protection_keys, subtree))
    }
}

/// A pending share addressed to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub owner: String,
    pub folder: FileId,
    /// Suggested mount name, the owner's folder name
    pub name: String,
}

impl Invitation {
    pub fn link(&self) -> SharedLink {
        SharedLink {
            owner: self.owner.clone(),
            folder: self.folder,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inbox {
    pub invitations: Vec<Invitation>,
}

impl BlockEncoded for Inbox {
    const KIND: &'static str = "inbox";
}
