//! Cryptographic primitives for Drift
//!
//! - **Identity**: every user holds an Ed25519 identity keypair; its public half
//!   is published in the DHT key directory
//! - **Content protection**: DHT entries are bound to a protection `KeyPair`;
//!   holding the private half is what "write access" means
//! - **Encryption**: ChaCha20-Poly1305 `Secret`s, one per chunk and one per
//!   shared folder document, plus a credentials-derived secret for the profile
//! - **Key handover**: `SecretShare` wraps a secret for another user's
//!   identity key (X25519 ECDH + AES-KW)

mod keys;
mod secret;
mod secret_share;

pub use ed25519_dalek::Signature;
pub use keys::{KeyError, KeyPair, PublicKey, SecretKey, PUBLIC_KEY_SIZE};
pub use secret::{Secret, SecretError, BLAKE3_HASH_SIZE};
pub use secret_share::{SecretShare, SecretShareError};

/// BLAKE3 hash of some plaintext content
pub type ContentHash = [u8; BLAKE3_HASH_SIZE];

pub fn content_hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}
