//! Chunked, encrypted file content in the DHT
//!
//! Each chunk gets its own fresh secret and lives under the hash of its
//! ciphertext, bound to the protection keys of the node that owns it.
//! The multi-chunk helpers here undo their own partial work before
//! returning an error, so a failed step leaves nothing behind.

use bytes::Bytes;

use crate::crypto::{content_hash, KeyPair, Secret};
use crate::dht::{Authorization, DhtKey, DhtStore, RetryPolicy, Version};
use crate::error::SyncError;
use crate::index::{ChunkRef, FileIndex};

/// An encrypted chunk waiting to be stored
#[derive(Debug, Clone)]
pub(crate) struct SealedChunk {
    pub key: DhtKey,
    pub ciphertext: Bytes,
}

/// Split and encrypt `data`. An empty file has no chunks
pub(crate) fn seal(data: &[u8], chunk_size: usize) -> Result<(FileIndex, Vec<SealedChunk>), SyncError> {
    let mut refs = Vec::new();
    let mut sealed = Vec::new();
    for piece in data.chunks(chunk_size.max(1)) {
        let secret = Secret::generate();
        let ciphertext = Bytes::from(secret.encrypt(piece)?);
        let key = DhtKey::chunk(&ciphertext);
        refs.push(ChunkRef {
            key,
            secret,
            size: piece.len() as u64,
        });
        sealed.push(SealedChunk { key, ciphertext });
    }
    let file = FileIndex {
        size: data.len() as u64,
        content_hash: content_hash(data),
        chunks: refs,
    };
    Ok((file, sealed))
}

/// Store chunks protected by `keys`
pub(crate) async fn put_chunks(
    dht: &dyn DhtStore,
    retry: RetryPolicy,
    chunks: &[SealedChunk],
    keys: &KeyPair,
) -> Result<(), SyncError> {
    let mut stored = Vec::new();
    for chunk in chunks {
        let auth = Authorization::sign(keys, &chunk.key, Version::ZERO, &chunk.ciphertext);
        let result = retry
            .run("put chunk", || {
                dht.put(
                    &chunk.key,
                    Version::ZERO,
                    chunk.ciphertext.clone(),
                    Some(auth.clone()),
                )
            })
            .await;
        if let Err(err) = result {
            discard(dht, retry, &stored, keys).await;
            return Err(err.into());
        }
        stored.push(chunk.key);
    }
    tracing::debug!("stored {} chunk(s)", stored.len());
    Ok(())
}

/// Chunk locations of every file in `files`
pub(crate) fn chunk_keys<'a>(files: impl IntoIterator<Item = &'a FileIndex>) -> Vec<DhtKey> {
    files
        .into_iter()
        .flat_map(|file| file.chunks.iter().map(|chunk: &ChunkRef| chunk.key))
        .collect()
}

/// Remove chunks bound to `keys`, handing back what was removed so it can
///  be put back. Chunks that are already gone are skipped
pub(crate) async fn remove_chunks(
    dht: &dyn DhtStore,
    retry: RetryPolicy,
    chunks: &[DhtKey],
    keys: &KeyPair,
) -> Result<Vec<SealedChunk>, SyncError> {
    let mut removed = Vec::new();
    for key in chunks {
        match remove_one(dht, retry, key, keys).await {
            Ok(Some(ciphertext)) => removed.push(SealedChunk {
                key: *key,
                ciphertext,
            }),
            Ok(None) => {}
            Err(err) => {
                if let Err(restore) = put_chunks(dht, retry, &removed, keys).await {
                    tracing::warn!("could not restore removed chunks: {}", restore);
                }
                return Err(err);
            }
        }
    }
    Ok(removed)
}

async fn remove_one(
    dht: &dyn DhtStore,
    retry: RetryPolicy,
    key: &DhtKey,
    keys: &KeyPair,
) -> Result<Option<Bytes>, SyncError> {
    let Some(entry) = retry.run("get chunk", || dht.get(key)).await? else {
        return Ok(None);
    };
    let auth = Authorization::sign(keys, key, entry.version, &[]);
    retry
        .run("remove chunk", || dht.remove(key, entry.version, Some(auth.clone())))
        .await?;
    Ok(Some(entry.value))
}

/// Best effort cleanup of chunks a failed step stored itself
async fn discard(dht: &dyn DhtStore, retry: RetryPolicy, stored: &[DhtKey], keys: &KeyPair) {
    for key in stored {
        if let Err(err) = remove_one(dht, retry, key, keys).await {
            tracing::warn!("orphaned chunk {}: {}", key, err);
        }
    }
}

/// Fetch, decrypt and verify a file's content
pub(crate) async fn fetch(
    dht: &dyn DhtStore,
    retry: RetryPolicy,
    file: &FileIndex,
) -> Result<Vec<u8>, SyncError> {
    // grows with what the chunks actually hold
    let mut data = Vec::new();
    for chunk in &file.chunks {
        let entry = retry
            .run("get chunk", || dht.get(&chunk.key))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("chunk {}", chunk.key)))?;
        let plaintext = chunk.secret.decrypt(&entry.value)?;
        if plaintext.len() as u64 != chunk.size {
            return Err(SyncError::Crypto(format!(
                "chunk {} has {} bytes, index says {}",
                chunk.key,
                plaintext.len(),
                chunk.size
            )));
        }
        data.extend_from_slice(&plaintext);
    }
    if data.len() as u64 != file.size {
        return Err(SyncError::Crypto(format!(
            "file has {} bytes, index says {}",
            data.len(),
            file.size
        )));
    }
    if content_hash(&data) != file.content_hash {
        return Err(SyncError::Crypto("content hash mismatch".into()));
    }
    Ok(data)
}

/// Rebind every chunk from `from` to `to`. On failure the chunks already
///  rebound are moved back
pub(crate) async fn reprotect(
    dht: &dyn DhtStore,
    retry: RetryPolicy,
    chunks: &[DhtKey],
    from: &KeyPair,
    to: &KeyPair,
) -> Result<(), SyncError> {
    if from.public() == to.public() {
        return Ok(());
    }
    let mut done = Vec::new();
    for key in chunks {
        if let Err(err) = protect_one(dht, retry, key, from, to).await {
            for key in done.iter().rev() {
                if let Err(undo) = protect_one(dht, retry, key, to, from).await {
                    tracing::warn!("chunk {} left with new protection: {}", key, undo);
                }
            }
            return Err(err);
        }
        done.push(*key);
    }
    tracing::debug!("re-protected {} chunk(s)", done.len());
    Ok(())
}

async fn protect_one(
    dht: &dyn DhtStore,
    retry: RetryPolicy,
    key: &DhtKey,
    from: &KeyPair,
    to: &KeyPair,
) -> Result<(), SyncError> {
    let entry = retry
        .run("get chunk", || dht.get(key))
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("chunk {}", key)))?;
    let next = to.public();
    let auth = Authorization::sign(from, key, entry.version, next.as_bytes());
    retry
        .run("protect chunk", || dht.protect(key, entry.version, next, auth.clone()))
        .await?;
    Ok(())
}
