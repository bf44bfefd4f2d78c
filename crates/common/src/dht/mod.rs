//! The DHT as seen by the sync engine
//!
//! A flat key space of versioned, optionally protected entries:
//! - every key has a monotonic version counter; `Version::ZERO` means absent
//! - `put` and `remove` are compare-and-swap on that version
//! - an entry bound to a protection public key only accepts mutations
//!   signed with the matching private key
//!
//! Keys are derived, never chosen: see [`DhtKey`].

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PublicKey, Signature};

pub mod memory;
mod retry;

pub use memory::MemoryDht;
pub use retry::RetryPolicy;

const PROFILE_CONTEXT: &str = "drift 2026-10 profile document key";
const PUBLIC_KEY_CONTEXT: &str = "drift 2026-10 user public key directory";
const INBOX_CONTEXT: &str = "drift 2026-10 share inbox key";
const SHARED_FOLDER_CONTEXT: &str = "drift 2026-10 shared folder document key";
const CHUNK_CONTEXT: &str = "drift 2026-10 content chunk key";

/// A location in the DHT
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DhtKey([u8; 32]);

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

impl DhtKey {
    fn derive(context: &str, material: &[u8]) -> Self {
        Self(blake3::derive_key(context, material))
    }

    /// The user's own profile document
    pub fn profile(user_id: &str) -> Self {
        Self::derive(PROFILE_CONTEXT, user_id.as_bytes())
    }

    /// The user's identity public key, published at registration
    pub fn public_key(user_id: &str) -> Self {
        Self::derive(PUBLIC_KEY_CONTEXT, user_id.as_bytes())
    }

    /// Invitations addressed to the user
    pub fn inbox(user_id: &str) -> Self {
        Self::derive(INBOX_CONTEXT, user_id.as_bytes())
    }

    /// The document holding a shared folder's subtree
    pub fn shared_folder(owner: &str, folder: &PublicKey) -> Self {
        let mut material = Vec::with_capacity(owner.len() + 1 + 32);
        material.extend_from_slice(owner.as_bytes());
        material.push(0);
        material.extend_from_slice(folder.as_bytes());
        Self::derive(SHARED_FOLDER_CONTEXT, &material)
    }

    /// An encrypted content chunk, addressed by its ciphertext
    pub fn chunk(ciphertext: &[u8]) -> Self {
        Self::derive(CHUNK_CONTEXT, blake3::hash(ciphertext).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Monotonic per-key version counter
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    /// The version of a key that holds nothing
    pub const ZERO: Version = Version(0);

    pub fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_absent(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A stored value and the version it was written under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Bytes,
    pub version: Version,
    pub protection: Option<PublicKey>,
}

/// Proof that the caller holds a protection private key for one mutation
#[derive(Debug, Clone)]
pub struct Authorization {
    pub public: PublicKey,
    pub signature: Signature,
}

impl Authorization {
    /// Sign a put or remove of `payload` at `key` on top of `base`
    pub fn sign(keys: &KeyPair, key: &DhtKey, base: Version, payload: &[u8]) -> Self {
        let message = mutation_message(key, base, payload);
        Self {
            public: keys.public(),
            signature: keys.sign(&message),
        }
    }

    pub fn verify(&self, key: &DhtKey, base: Version, payload: &[u8]) -> bool {
        let message = mutation_message(key, base, payload);
        self.public.verify(&message, &self.signature).is_ok()
    }
}

pub(crate) fn mutation_message(key: &DhtKey, base: Version, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(32 + 8 + 32);
    message.extend_from_slice(key.as_bytes());
    message.extend_from_slice(&base.get().to_be_bytes());
    message.extend_from_slice(blake3::hash(payload).as_bytes());
    message
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DhtError {
    /// The caller's base version is stale
    #[error("version conflict at {key}: expected {expected}, current {current}")]
    Conflict {
        key: DhtKey,
        expected: Version,
        current: Version,
    },
    /// The entry is bound to a different protection key, or the signature is bad
    #[error("entry {0} rejected the protection key")]
    ProtectionDenied(DhtKey),
    #[error("nothing stored at {0}")]
    NotFound(DhtKey),
    /// Transient: the network could not serve the request
    #[error("dht unavailable: {0}")]
    Unavailable(String),
}

/// The replicated key-value network
///
/// Replication and routing are the implementation's concern; callers only
/// rely on the compare-and-swap and protection contracts.
#[async_trait]
pub trait DhtStore: Send + Sync + fmt::Debug + 'static {
    /// Latest entry at `key`, if any
    async fn get(&self, key: &DhtKey) -> Result<Option<Entry>, DhtError>;

    /// A specific historic version of `key`
    async fn get_version(&self, key: &DhtKey, version: Version)
        -> Result<Option<Entry>, DhtError>;

    /// Store `value` if the current version of `key` is `base`
    ///
    /// A put onto an absent key with an authorization binds the entry to
    /// that protection key. Returns the new version.
    async fn put(
        &self,
        key: &DhtKey,
        base: Version,
        value: Bytes,
        auth: Option<Authorization>,
    ) -> Result<Version, DhtError>;

    /// Delete the entry if its current version is `base`
    async fn remove(
        &self,
        key: &DhtKey,
        base: Version,
        auth: Option<Authorization>,
    ) -> Result<(), DhtError>;

    /// Rebind a protected entry to `next`, authorized by the current key.
    ///  The signed payload is `next`'s bytes
    async fn protect(
        &self,
        key: &DhtKey,
        base: Version,
        next: PublicKey,
        auth: Authorization,
    ) -> Result<Version, DhtError>;
}
