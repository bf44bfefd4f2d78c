use std::fmt;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of Ed25519 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of Ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Public half of an Ed25519 keypair
///
/// Used in three places:
/// - **User identity**: published in the key directory so others can share with the user
/// - **File identity**: every index node is named by a freshly generated public key
/// - **Content protection**: DHT entries are bound to a protection public key and only
///   accept writes signed by the matching private key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_short_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<[u8; PUBLIC_KEY_SIZE]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: [u8; PUBLIC_KEY_SIZE]) -> Result<Self, Self::Error> {
        // reject bytes that are not a valid curve point
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid public key: {}", e))?;
        Ok(PublicKey(bytes))
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid public key size, expected {}, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut buff = [0; PUBLIC_KEY_SIZE];
        buff.copy_from_slice(bytes);
        PublicKey::try_from(buff)
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines
    pub fn to_short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Convert Ed25519 public key to X25519 (Montgomery curve) for ECDH
    ///
    /// # Errors
    ///
    /// Returns an error if the Ed25519 point cannot be decompressed.
    #[allow(clippy::wrong_self_convention)]
    pub(crate) fn to_x25519(&self) -> Result<X25519PublicKey, KeyError> {
        let edwards_point = CompressedEdwardsY::from_slice(&self.0)
            .map_err(|_| anyhow::anyhow!("public key invalid edwards point"))?
            .decompress()
            .ok_or_else(|| anyhow::anyhow!("public key failed to decompress edwards point"))?;

        let montgomery_point = edwards_point.to_montgomery();
        Ok(X25519PublicKey::from(montgomery_point.to_bytes()))
    }

    /// Verify an Ed25519 signature on a message.
    pub fn verify(
        &self,
        msg: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        let verifying_key = VerifyingKey::from_bytes(&self.0)?;
        verifying_key.verify_strict(msg, signature)
    }
}

/// Private half of an Ed25519 keypair
///
/// Identity and protection secret keys live inside the encrypted profile
/// document; they never travel in the clear.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey([u8; PRIVATE_KEY_SIZE]);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(public: {})", self.public().to_short_hex())
    }
}

impl From<[u8; PRIVATE_KEY_SIZE]> for SecretKey {
    fn from(secret: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(secret)
    }
}

impl SecretKey {
    /// Generate a new random secret key using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self::from(bytes)
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.0)
    }

    /// Derive the public key from this secret key
    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing_key().verifying_key().to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0
    }

    /// Convert Ed25519 secret key to X25519 (Montgomery curve) for ECDH
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key().to_scalar_bytes())
    }

    /// Sign a message with this secret key using Ed25519.
    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key().sign(msg)
    }
}

/// A content-protection keypair
///
/// Whoever holds the private half may mutate the DHT entries bound to the
/// public half. Users with read-only access never see one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    secret: SecretKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public().to_short_hex())
    }
}

impl From<SecretKey> for KeyPair {
    fn from(secret: SecretKey) -> Self {
        Self { secret }
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from(SecretKey::generate())
    }

    pub fn public(&self) -> PublicKey {
        self.secret.public()
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        self.secret.sign(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_public_key_from_directory_bytes() {
        let public = SecretKey::generate().public();
        let recovered = PublicKey::try_from(&public.as_bytes()[..]).unwrap();
        assert_eq!(public, recovered);
        assert_eq!(public.to_string().len(), 2 * PUBLIC_KEY_SIZE);
    }

    #[test]
    fn test_keypair_rebuilt_from_secret() {
        let keys = KeyPair::generate();
        let rebuilt = KeyPair::from(SecretKey::from(keys.secret().to_bytes()));
        assert_eq!(keys, rebuilt);
        assert_eq!(keys.public(), rebuilt.public());
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyPair::generate();
        let message = b"profile v2";

        let signature = keys.sign(message);
        assert!(keys.public().verify(message, &signature).is_ok());
        assert!(keys.public().verify(b"profile v3", &signature).is_err());

        let other = KeyPair::generate().public();
        assert!(other.verify(message, &signature).is_err());
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        assert!(PublicKey::try_from(&[7u8; 31][..]).is_err());
    }
}
