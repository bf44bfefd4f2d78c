//! DAG-CBOR block encoding for everything we put in the DHT
//!
//! DAG-CBOR only admits string map keys, so encoded types key their maps by
//! user id or hex strings and store arenas as plain lists.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {kind}: {reason}")]
    Encode { kind: &'static str, reason: String },
    #[error("failed to decode {kind}: {reason}")]
    Decode { kind: &'static str, reason: String },
}

/// Types that travel as a single DAG-CBOR block
pub trait BlockEncoded: Serialize + DeserializeOwned + Sized {
    /// Short name used in error messages
    const KIND: &'static str;

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| CodecError::Encode {
            kind: Self::KIND,
            reason: e.to_string(),
        })
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_ipld_dagcbor::from_slice(bytes).map_err(|e| CodecError::Decode {
            kind: Self::KIND,
            reason: e.to_string(),
        })
    }
}
