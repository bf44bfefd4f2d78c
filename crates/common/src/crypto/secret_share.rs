//! Key handover using ECDH + AES Key Wrap
//!
//! Shared folder documents carry one `SecretShare` per member for the
//! document secret, and writers get a second one wrapping the folder's
//! protection private key.
//!
//! To wrap for a recipient:
//! 1. Generate an ephemeral Ed25519 keypair
//! 2. Convert both keys to X25519 and run ECDH
//! 3. AES-KW wrap the 32 byte secret with the shared secret
//! 4. Package as `ephemeral_pubkey || wrapped_secret`

use std::convert::TryFrom;

use aes_kw::KekAes256 as Kek;
use serde::{Deserialize, Serialize};

use super::keys::{KeyError, KeyPair, PublicKey, SecretKey, PUBLIC_KEY_SIZE};
use super::secret::{Secret, SecretError, SECRET_SIZE};

/// Size of AES Key Wrap integrity block in bytes
pub const KW_NONCE_SIZE: usize = 8;
/// Total size of a share in bytes: ephemeral_pubkey (32) || wrapped_secret (40)
pub const SECRET_SHARE_SIZE: usize = PUBLIC_KEY_SIZE + SECRET_SIZE + KW_NONCE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum SecretShareError {
    #[error("share error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

/// A 32 byte secret wrapped for exactly one recipient public key
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SecretShare([u8; SECRET_SHARE_SIZE]);

impl Serialize for SecretShare {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretShare {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{Error, Visitor};
        use std::fmt;

        struct ShareVisitor;

        impl<'de> Visitor<'de> for ShareVisitor {
            type Value = SecretShare;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "{} bytes", SECRET_SHARE_SIZE)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: Error,
            {
                SecretShare::try_from(v).map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(SECRET_SHARE_SIZE);
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                SecretShare::try_from(bytes.as_slice())
                    .map_err(|_| A::Error::invalid_length(bytes.len(), &self))
            }
        }

        // bytes for DAG-CBOR, seq for JSON
        deserializer.deserialize_byte_buf(ShareVisitor)
    }
}

impl TryFrom<&[u8]> for SecretShare {
    type Error = SecretShareError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != SECRET_SHARE_SIZE {
            return Err(anyhow::anyhow!(
                "invalid share size, expected {}, got {}",
                SECRET_SHARE_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut share = [0; SECRET_SHARE_SIZE];
        share.copy_from_slice(bytes);
        Ok(SecretShare(share))
    }
}

impl SecretShare {
    /// Wrap `secret` so that only the holder of `recipient`'s private key can recover it
    pub fn new(secret: &Secret, recipient: &PublicKey) -> Result<Self, SecretShareError> {
        let ephemeral_private = SecretKey::generate();
        let ephemeral_public = ephemeral_private.public();

        let shared_secret = ephemeral_private
            .to_x25519()
            .diffie_hellman(&recipient.to_x25519()?);

        let kek = Kek::from(*shared_secret.as_bytes());
        let wrapped = kek
            .wrap_vec(secret.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        if PUBLIC_KEY_SIZE + wrapped.len() != SECRET_SHARE_SIZE {
            return Err(anyhow::anyhow!("expected share size is incorrect").into());
        };

        let mut share = [0; SECRET_SHARE_SIZE];
        share[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral_public.as_bytes());
        share[PUBLIC_KEY_SIZE..].copy_from_slice(&wrapped);

        Ok(SecretShare(share))
    }

    /// Wrap the private half of a protection keypair for `recipient`
    pub fn for_keypair(keys: &KeyPair, recipient: &PublicKey) -> Result<Self, SecretShareError> {
        Self::new(&Secret::from(keys.secret().to_bytes()), recipient)
    }

    /// Recover the wrapped secret using the recipient's private key
    ///
    /// Fails if the share was made for a different recipient or was tampered with.
    pub fn recover(&self, recipient_secret: &SecretKey) -> Result<Secret, SecretShareError> {
        let ephemeral_public = PublicKey::try_from(&self.0[..PUBLIC_KEY_SIZE])?;

        let shared_secret = recipient_secret
            .to_x25519()
            .diffie_hellman(&ephemeral_public.to_x25519()?);

        let kek = Kek::from(*shared_secret.as_bytes());
        let unwrapped = kek
            .unwrap_vec(&self.0[PUBLIC_KEY_SIZE..])
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;

        Ok(Secret::from_slice(&unwrapped)?)
    }

    /// Recover a protection keypair wrapped with [`SecretShare::for_keypair`]
    pub fn recover_keypair(&self, recipient_secret: &SecretKey) -> Result<KeyPair, SecretShareError> {
        let secret = self.recover(recipient_secret)?;
        Ok(KeyPair::from(SecretKey::from(*secret)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_share_secret() {
        let secret = Secret::from_slice(&[42u8; SECRET_SIZE]).unwrap();
        let private_key = SecretKey::generate();
        let share = SecretShare::new(&secret, &private_key.public()).unwrap();
        assert_eq!(share.recover(&private_key).unwrap(), secret);
    }

    #[test]
    fn test_share_wrong_recipient() {
        let secret = Secret::generate();
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let share = SecretShare::new(&secret, &alice.public()).unwrap();
        assert_eq!(share.recover(&alice).unwrap(), secret);
        assert!(share.recover(&bob).is_err());
    }

    #[test]
    fn test_share_keypair() {
        let protection = KeyPair::generate();
        let bob = SecretKey::generate();

        let share = SecretShare::for_keypair(&protection, &bob.public()).unwrap();
        let recovered = share.recover_keypair(&bob).unwrap();
        assert_eq!(recovered.public(), protection.public());
    }

    #[test]
    fn test_share_dag_cbor_roundtrip() {
        let secret = Secret::generate();
        let private_key = SecretKey::generate();
        let share = SecretShare::new(&secret, &private_key.public()).unwrap();

        let encoded = serde_ipld_dagcbor::to_vec(&share).unwrap();
        let decoded: SecretShare = serde_ipld_dagcbor::from_slice(&encoded).unwrap();

        assert_eq!(share, decoded);
        assert_eq!(decoded.recover(&private_key).unwrap(), secret);
    }

    #[test]
    fn test_share_serde_json_roundtrip() {
        let secret = Secret::generate();
        let private_key = SecretKey::generate();
        let share = SecretShare::new(&secret, &private_key.public()).unwrap();

        let json = serde_json::to_string(&share).unwrap();
        let decoded: SecretShare = serde_json::from_str(&json).unwrap();
        assert_eq!(share, decoded);
    }

    #[test]
    fn test_share_deserialize_invalid_length() {
        let short = serde_json::to_string(&vec![0u8; SECRET_SHARE_SIZE - 1]).unwrap();
        assert!(serde_json::from_str::<SecretShare>(&short).is_err());
    }
}
