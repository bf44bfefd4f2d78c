//! Registration of a new user
//!
//! Two steps: write the empty profile, then publish the identity public
//! key. A failed publish rolls the profile back out of the DHT so the user
//! id is free to register again.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ProfileStore, UserProfile};
use crate::crypto::{KeyPair, SecretKey};
use crate::dht::{Authorization, DhtKey, Version};
use crate::error::SyncError;
use crate::index::IndexTree;
use crate::process::{Process, ProcessComponent, Step};

pub(super) type Registered = Arc<Mutex<Option<UserProfile>>>;

pub(super) fn registration(store: &ProfileStore, registered: Registered) -> Process {
    let root = ProcessComponent::sequence([
        ProcessComponent::step(WriteProfile {
            store: store.clone(),
            registered: registered.clone(),
        }),
        ProcessComponent::step(PublishKey {
            store: store.clone(),
            registered,
        }),
    ]);
    Process::new(format!("register {}", store.user_id()), root)
}

fn registered_profile(registered: &Registered) -> Result<UserProfile, SyncError> {
    registered
        .lock()
        .clone()
        .ok_or_else(|| SyncError::NotFound("registered profile".into()))
}

/// Put an empty profile under fresh identity and protection keys
struct WriteProfile {
    store: ProfileStore,
    registered: Registered,
}

#[async_trait]
impl Step for WriteProfile {
    fn name(&self) -> &str {
        "write profile"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let user_id = self.store.user_id().to_string();
        let protection_keys = KeyPair::generate();
        let tree = IndexTree::new(&user_id, Some(protection_keys.clone()));
        let mut profile = UserProfile::new(
            user_id.clone(),
            SecretKey::generate(),
            protection_keys,
            tree,
            Version::ZERO,
        );

        let version = match self.store.write(Version::ZERO, &profile).await {
            Err(SyncError::VersionConflict { .. }) | Err(SyncError::PermissionDenied(_)) => {
                return Err(SyncError::AlreadyExists(format!("user {}", user_id)));
            }
            result => result?,
        };
        profile.set_version(version);
        *self.registered.lock() = Some(profile);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let Some(profile) = self.registered.lock().take() else {
            return Ok(());
        };
        let key = DhtKey::profile(profile.user_id());
        let base = profile.version();
        let auth = Authorization::sign(profile.protection_keys(), &key, base, &[]);
        let dht = self.store.dht();
        self.store
            .retry()
            .run("remove profile", || dht.remove(&key, base, Some(auth.clone())))
            .await?;
        tracing::info!("withdrew half registered profile of {}", profile.user_id());
        Ok(())
    }
}

/// Publish the identity public key so others can share with the user
struct PublishKey {
    store: ProfileStore,
    registered: Registered,
}

#[async_trait]
impl Step for PublishKey {
    fn name(&self) -> &str {
        "publish public key"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let profile = registered_profile(&self.registered)?;
        let key = DhtKey::public_key(profile.user_id());
        let value = Bytes::copy_from_slice(profile.identity_public().as_bytes());
        let identity = KeyPair::from(profile.identity().clone());
        let auth = Authorization::sign(&identity, &key, Version::ZERO, &value);
        let dht = self.store.dht();
        self.store
            .retry()
            .run("put public key", || {
                dht.put(&key, Version::ZERO, value.clone(), Some(auth.clone()))
            })
            .await?;
        Ok(())
    }
}
