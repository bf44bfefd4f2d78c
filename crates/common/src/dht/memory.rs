use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{Authorization, DhtError, DhtKey, DhtStore, Entry, Version};
use crate::crypto::PublicKey;

/// In-process DHT honouring the full put/get/remove/protect contract
///
/// Cloning shares the same key space, so every session in a test talks to
/// one "network". Each call yields to the scheduler first to stand in for
/// a network round trip, which lets concurrent processes interleave.
#[derive(Debug, Clone, Default)]
pub struct MemoryDht {
    inner: Arc<RwLock<MemoryDhtInner>>,
}

#[derive(Debug, Default)]
struct MemoryDhtInner {
    slots: HashMap<DhtKey, Slot>,
    faults: Faults,
    puts: usize,
}

#[derive(Debug, Default)]
struct Slot {
    /// Every version ever written, including removed ones
    history: BTreeMap<Version, Entry>,
    /// None when the key is currently absent
    current: Option<Version>,
    /// Highest version handed out, survives removal
    last: Version,
}

impl Slot {
    fn current_version(&self) -> Version {
        self.current.unwrap_or(Version::ZERO)
    }

    fn live(&self) -> Option<&Entry> {
        self.current.and_then(|v| self.history.get(&v))
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    /// Puts to let through before the failing window starts
    skip_puts: usize,
    /// Puts to fail once the window starts
    failing_puts: usize,
    skip_removes: usize,
    failing_removes: usize,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `Unavailable` while set
    pub fn set_offline(&self, offline: bool) {
        self.inner.write().faults.offline = offline;
    }

    /// Let `skip` puts through, then fail the following `count` puts
    pub fn fail_puts_after(&self, skip: usize, count: usize) {
        let mut inner = self.inner.write();
        inner.faults.skip_puts = skip;
        inner.faults.failing_puts = count;
    }

    /// Let `skip` removes through, then fail the following `count` removes
    pub fn fail_removes_after(&self, skip: usize, count: usize) {
        let mut inner = self.inner.write();
        inner.faults.skip_removes = skip;
        inner.faults.failing_removes = count;
    }

    pub fn clear_faults(&self) {
        self.inner.write().faults = Faults::default();
    }

    /// Whether `key` currently holds a value
    pub fn contains(&self, key: &DhtKey) -> bool {
        self.inner
            .read()
            .slots
            .get(key)
            .is_some_and(|slot| slot.current.is_some())
    }

    /// All keys that currently hold a value
    pub fn live_keys(&self) -> Vec<DhtKey> {
        self.inner
            .read()
            .slots
            .iter()
            .filter(|(_, slot)| slot.current.is_some())
            .map(|(key, _)| *key)
            .collect()
    }

    /// The protection key a live entry is bound to
    pub fn protection_of(&self, key: &DhtKey) -> Option<PublicKey> {
        self.inner
            .read()
            .slots
            .get(key)
            .and_then(|slot| slot.live())
            .and_then(|entry| entry.protection)
    }

    /// Number of successful puts so far
    pub fn put_count(&self) -> usize {
        self.inner.read().puts
    }

    fn check_online(inner: &MemoryDhtInner) -> Result<(), DhtError> {
        if inner.faults.offline {
            return Err(DhtError::Unavailable("network offline".into()));
        }
        Ok(())
    }

    fn check_auth(
        key: &DhtKey,
        protection: Option<PublicKey>,
        auth: Option<&Authorization>,
        base: Version,
        payload: &[u8],
    ) -> Result<(), DhtError> {
        let Some(protection) = protection else {
            return Ok(());
        };
        match auth {
            Some(auth) if auth.public == protection && auth.verify(key, base, payload) => Ok(()),
            _ => Err(DhtError::ProtectionDenied(*key)),
        }
    }
}

#[async_trait]
impl DhtStore for MemoryDht {
    async fn get(&self, key: &DhtKey) -> Result<Option<Entry>, DhtError> {
        tokio::task::yield_now().await;
        let inner = self.inner.read();
        Self::check_online(&inner)?;
        Ok(inner.slots.get(key).and_then(|slot| slot.live()).cloned())
    }

    async fn get_version(
        &self,
        key: &DhtKey,
        version: Version,
    ) -> Result<Option<Entry>, DhtError> {
        tokio::task::yield_now().await;
        let inner = self.inner.read();
        Self::check_online(&inner)?;
        Ok(inner
            .slots
            .get(key)
            .and_then(|slot| slot.history.get(&version))
            .cloned())
    }

    async fn put(
        &self,
        key: &DhtKey,
        base: Version,
        value: Bytes,
        auth: Option<Authorization>,
    ) -> Result<Version, DhtError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.write();
        Self::check_online(&inner)?;

        if inner.faults.skip_puts > 0 {
            inner.faults.skip_puts -= 1;
        } else if inner.faults.failing_puts > 0 {
            inner.faults.failing_puts -= 1;
            tracing::debug!("memory dht: injected put failure at {}", key);
            return Err(DhtError::Unavailable(format!("injected put failure at {}", key)));
        }

        let slot = inner.slots.entry(*key).or_default();
        let current = slot.current_version();
        if base != current {
            return Err(DhtError::Conflict {
                key: *key,
                expected: base,
                current,
            });
        }

        let protection = match slot.live() {
            Some(entry) => {
                Self::check_auth(key, entry.protection, auth.as_ref(), base, &value)?;
                entry.protection
            }
            None => match &auth {
                Some(auth) if auth.verify(key, base, &value) => Some(auth.public),
                Some(_) => return Err(DhtError::ProtectionDenied(*key)),
                None => None,
            },
        };

        let version = slot.last.next();
        slot.last = version;
        slot.current = Some(version);
        slot.history.insert(
            version,
            Entry {
                value,
                version,
                protection,
            },
        );
        inner.puts += 1;

        tracing::trace!("memory dht: put {} at {}", key, version);
        Ok(version)
    }

    async fn remove(
        &self,
        key: &DhtKey,
        base: Version,
        auth: Option<Authorization>,
    ) -> Result<(), DhtError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.write();
        Self::check_online(&inner)?;

        if inner.faults.skip_removes > 0 {
            inner.faults.skip_removes -= 1;
        } else if inner.faults.failing_removes > 0 {
            inner.faults.failing_removes -= 1;
            tracing::debug!("memory dht: injected remove failure at {}", key);
            return Err(DhtError::Unavailable(format!(
                "injected remove failure at {}",
                key
            )));
        }

        let slot = inner.slots.get_mut(key).ok_or(DhtError::NotFound(*key))?;
        let entry = slot.live().ok_or(DhtError::NotFound(*key))?;
        if entry.version != base {
            return Err(DhtError::Conflict {
                key: *key,
                expected: base,
                current: entry.version,
            });
        }
        Self::check_auth(key, entry.protection, auth.as_ref(), base, &[])?;

        slot.current = None;
        tracing::trace!("memory dht: removed {} at {}", key, base);
        Ok(())
    }

    async fn protect(
        &self,
        key: &DhtKey,
        base: Version,
        next: PublicKey,
        auth: Authorization,
    ) -> Result<Version, DhtError> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.write();
        Self::check_online(&inner)?;

        let slot = inner.slots.get_mut(key).ok_or(DhtError::NotFound(*key))?;
        let entry = slot.live().ok_or(DhtError::NotFound(*key))?.clone();
        if entry.version != base {
            return Err(DhtError::Conflict {
                key: *key,
                expected: base,
                current: entry.version,
            });
        }
        // unprotected entries may be claimed by whoever signs
        let bound = entry.protection.unwrap_or(auth.public);
        Self::check_auth(key, Some(bound), Some(&auth), base, next.as_bytes())?;

        let version = slot.last.next();
        slot.last = version;
        slot.current = Some(version);
        slot.history.insert(
            version,
            Entry {
                value: entry.value,
                version,
                protection: Some(next),
            },
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn key() -> DhtKey {
        DhtKey::profile("alice")
    }

    #[tokio::test]
    async fn test_put_get_versions() {
        let dht = MemoryDht::new();
        let v1 = dht
            .put(&key(), Version::ZERO, Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        let v2 = dht
            .put(&key(), v1, Bytes::from_static(b"two"), None)
            .await
            .unwrap();

        assert!(v2 > v1);
        let latest = dht.get(&key()).await.unwrap().unwrap();
        assert_eq!(latest.value, Bytes::from_static(b"two"));
        assert_eq!(latest.version, v2);

        let old = dht.get_version(&key(), v1).await.unwrap().unwrap();
        assert_eq!(old.value, Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn test_stale_base_conflicts() {
        let dht = MemoryDht::new();
        let v1 = dht
            .put(&key(), Version::ZERO, Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        dht.put(&key(), v1, Bytes::from_static(b"two"), None)
            .await
            .unwrap();

        let result = dht
            .put(&key(), v1, Bytes::from_static(b"lost update"), None)
            .await;
        assert!(matches!(
            result,
            Err(DhtError::Conflict { expected, .. }) if expected == v1
        ));
    }

    #[tokio::test]
    async fn test_protected_entry_requires_signature() {
        let dht = MemoryDht::new();
        let owner = KeyPair::generate();
        let intruder = KeyPair::generate();

        let value = Bytes::from_static(b"doc");
        let auth = Authorization::sign(&owner, &key(), Version::ZERO, &value);
        let v1 = dht
            .put(&key(), Version::ZERO, value, Some(auth))
            .await
            .unwrap();
        assert_eq!(dht.protection_of(&key()), Some(owner.public()));

        let value = Bytes::from_static(b"forged");
        let forged = Authorization::sign(&intruder, &key(), v1, &value);
        let result = dht.put(&key(), v1, value.clone(), Some(forged)).await;
        assert_eq!(result, Err(DhtError::ProtectionDenied(key())));

        let result = dht.put(&key(), v1, value, None).await;
        assert_eq!(result, Err(DhtError::ProtectionDenied(key())));
    }

    #[tokio::test]
    async fn test_protect_rebinds_entry() {
        let dht = MemoryDht::new();
        let old = KeyPair::generate();
        let new = KeyPair::generate();

        let value = Bytes::from_static(b"chunk");
        let auth = Authorization::sign(&old, &key(), Version::ZERO, &value);
        let v1 = dht
            .put(&key(), Version::ZERO, value, Some(auth))
            .await
            .unwrap();

        let auth = Authorization::sign(&old, &key(), v1, new.public().as_bytes());
        let v2 = dht.protect(&key(), v1, new.public(), auth).await.unwrap();
        assert_eq!(dht.protection_of(&key()), Some(new.public()));

        // the old key can no longer remove it
        let auth = Authorization::sign(&old, &key(), v2, &[]);
        assert!(dht.remove(&key(), v2, Some(auth)).await.is_err());
        let auth = Authorization::sign(&new, &key(), v2, &[]);
        dht.remove(&key(), v2, Some(auth)).await.unwrap();
        assert!(!dht.contains(&key()));
    }

    #[tokio::test]
    async fn test_versions_survive_removal() {
        let dht = MemoryDht::new();
        let v1 = dht
            .put(&key(), Version::ZERO, Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        dht.remove(&key(), v1, None).await.unwrap();
        assert!(dht.get(&key()).await.unwrap().is_none());

        let v2 = dht
            .put(&key(), Version::ZERO, Bytes::from_static(b"again"), None)
            .await
            .unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_injected_put_failures() {
        let dht = MemoryDht::new();
        dht.fail_puts_after(1, 1);

        let v1 = dht
            .put(&key(), Version::ZERO, Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        let failed = dht.put(&key(), v1, Bytes::from_static(b"two"), None).await;
        assert!(matches!(failed, Err(DhtError::Unavailable(_))));
        dht.put(&key(), v1, Bytes::from_static(b"two"), None)
            .await
            .unwrap();

        dht.set_offline(true);
        assert!(dht.get(&key()).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_remove_failures() {
        let dht = MemoryDht::new();
        let other = DhtKey::inbox("bob");
        let v1 = dht
            .put(&key(), Version::ZERO, Bytes::from_static(b"one"), None)
            .await
            .unwrap();
        let v2 = dht
            .put(&other, Version::ZERO, Bytes::from_static(b"two"), None)
            .await
            .unwrap();
        dht.fail_removes_after(1, 1);

        dht.remove(&key(), v1, None).await.unwrap();
        let failed = dht.remove(&other, v2, None).await;
        assert!(matches!(failed, Err(DhtError::Unavailable(_))));
        assert!(dht.contains(&other));
        dht.remove(&other, v2, None).await.unwrap();
        assert!(dht.live_keys().is_empty());
    }
}
