use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use super::document::{ProfileBody, SharedFolderDocument};
use super::register::{self, Registered};
use super::{Document, MountState, UserCredentials, UserProfile};
use crate::codec::BlockEncoded;
use crate::config::SyncConfig;
use crate::crypto::{KeyPair, Secret, SecretKey};
use crate::dht::{Authorization, DhtKey, DhtStore, Entry, RetryPolicy, Version};
use crate::error::SyncError;
use crate::index::{FileId, IndexTree, SharedLink};

/**
 * ProfileStore
 * ============
 * Reads and writes one user's profile documents with optimistic
 *  concurrency: every write names the version it was based on and fails
 *  with `VersionConflict` if another writer got there first.
 * `commit` wraps that into a bounded read-modify-write loop, so callers
 *  describe a mutation once and never see conflicts unless the document
 *  stays contended for `max_commit_attempts` rounds.
 */
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dht: Arc<dyn DhtStore>,
    credentials: UserCredentials,
    secret: Secret,
    config: SyncConfig,
    retry: RetryPolicy,
}

impl ProfileStore {
    pub fn new(dht: Arc<dyn DhtStore>, credentials: UserCredentials, config: SyncConfig) -> Self {
        let secret = credentials.profile_secret();
        let retry = RetryPolicy::from(&config);
        Self {
            dht,
            credentials,
            secret,
            config,
            retry,
        }
    }

    pub fn user_id(&self) -> &str {
        self.credentials.user_id()
    }

    pub fn dht(&self) -> &Arc<dyn DhtStore> {
        &self.dht
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Register a new user: an empty profile plus the published identity key
    ///
    /// Runs as a process, so a failed key publish withdraws the profile again.
    pub async fn create(&self) -> Result<UserProfile, SyncError> {
        let registered = Registered::default();
        register::registration(self, registered.clone()).run().await?;
        let profile = registered
            .lock()
            .take()
            .ok_or_else(|| SyncError::NotFound(format!("registered profile of {}", self.user_id())))?;
        tracing::info!("registered user {}", self.user_id());
        Ok(profile)
    }

    /// The latest profile, with every mounted shared folder resolved
    pub async fn read(&self) -> Result<UserProfile, SyncError> {
        let key = DhtKey::profile(self.user_id());
        let entry = self
            .retry
            .run("get profile", || self.dht.get(&key))
            .await
            .map_err(|err| SyncError::ProfileUnavailable(err.to_string()))?
            .ok_or_else(|| {
                SyncError::ProfileUnavailable(format!("no profile stored for {}", self.user_id()))
            })?;
        self.open(entry).await
    }

    /// The own document as it was at `version`. Shared folders resolve to
    ///  their current state
    pub async fn read_version(&self, version: Version) -> Result<UserProfile, SyncError> {
        let key = DhtKey::profile(self.user_id());
        let entry = self
            .retry
            .run("get profile version", || self.dht.get_version(&key, version))
            .await
            .map_err(|err| SyncError::ProfileUnavailable(err.to_string()))?
            .ok_or_else(|| {
                SyncError::NotFound(format!("profile of {} at {}", self.user_id(), version))
            })?;
        self.open(entry).await
    }

    /// Write the own document on top of `base`
    pub async fn write(&self, base: Version, profile: &UserProfile) -> Result<Version, SyncError> {
        let body = ProfileBody {
            user_id: profile.user_id().to_string(),
            identity: profile.identity().clone(),
            protection: profile.protection_keys().secret().clone(),
            tree: profile.own_document_tree()?,
        };
        let value = Bytes::from(self.secret.encrypt(&body.encode()?)?);
        let key = DhtKey::profile(self.user_id());
        let auth = Authorization::sign(profile.protection_keys(), &key, base, &value);

        let version = self
            .retry
            .run("put profile", || {
                self.dht.put(&key, base, value.clone(), Some(auth.clone()))
            })
            .await?;
        tracing::debug!("wrote profile of {} at {} (base {})", self.user_id(), version, base);
        Ok(version)
    }

    /// Write the shared document rooted at `folder` on top of `base`
    pub async fn write_shared(
        &self,
        folder: &FileId,
        base: Version,
        profile: &UserProfile,
    ) -> Result<Version, SyncError> {
        let mount = profile
            .mount(folder)
            .ok_or_else(|| SyncError::NotFound(format!("shared folder {:?}", folder)))?;
        let keys = mount.protection_keys.as_ref().ok_or_else(|| {
            SyncError::PermissionDenied(format!(
                "{} has read-only access to shared folder {:?}",
                self.user_id(),
                folder
            ))
        })?;
        let subtree = profile.shared_document_tree(folder)?;
        let document = SharedFolderDocument::seal(
            &mount.link,
            keys.public(),
            mount.members.clone(),
            &mount.secret,
            &subtree,
        )?;
        self.put_shared(base, &document, keys).await
    }

    /// Apply `mutation` to the latest profile and persist `document`
    ///
    /// On a version conflict the profile is re-read and the mutation
    /// re-applied from scratch, up to `max_commit_attempts` times. Returns
    /// the profile as committed.
    pub async fn commit<F>(&self, document: Document, mut mutation: F) -> Result<UserProfile, SyncError>
    where
        F: FnMut(&mut UserProfile) -> Result<(), SyncError> + Send,
    {
        let attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut profile = self.read().await?;
            mutation(&mut profile)?;

            let result = match document {
                Document::Own => self
                    .write(profile.version(), &profile)
                    .await
                    .map(|version| profile.set_version(version)),
                Document::Shared(folder) => {
                    let base = profile
                        .mount(&folder)
                        .map(|mount| mount.version)
                        .ok_or_else(|| SyncError::NotFound(format!("shared folder {:?}", folder)))?;
                    self.write_shared(&folder, base, &profile)
                        .await
                        .map(|version| {
                            if let Some(mount) = profile.mount_mut(&folder) {
                                mount.version = version;
                            }
                        })
                }
            };

            match result {
                Ok(()) => return Ok(profile),
                Err(err) if err.is_conflict() && attempt < attempts => {
                    tracing::debug!(
                        "commit of {:?} for {} conflicted ({}), attempt {}/{}",
                        document,
                        self.user_id(),
                        err,
                        attempt,
                        attempts
                    );
                    self.backoff(attempt).await;
                }
                Err(err) => {
                    if err.is_conflict() {
                        tracing::warn!(
                            "commit for {} gave up after {} attempts: {}",
                            self.user_id(),
                            attempts,
                            err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.commit_backoff_ms;
        let jitter = rand::rng().random_range(0..=base);
        let delay = Duration::from_millis(base * u64::from(attempt) + jitter);
        tokio::time::sleep(delay).await;
    }

    /* Shared folder documents */

    pub(crate) async fn read_shared(
        &self,
        link: &SharedLink,
    ) -> Result<Option<(SharedFolderDocument, Version)>, SyncError> {
        let key = link.document_key();
        let entry = self
            .retry
            .run("get shared folder", || self.dht.get(&key))
            .await?;
        match entry {
            Some(entry) => Ok(Some((
                SharedFolderDocument::decode(&entry.value)?,
                entry.version,
            ))),
            None => Ok(None),
        }
    }

    pub(crate) async fn put_shared(
        &self,
        base: Version,
        document: &SharedFolderDocument,
        keys: &KeyPair,
    ) -> Result<Version, SyncError> {
        let key = document.link().document_key();
        let value = Bytes::from(document.encode()?);
        let auth = Authorization::sign(keys, &key, base, &value);
        let version = self
            .retry
            .run("put shared folder", || {
                self.dht.put(&key, base, value.clone(), Some(auth.clone()))
            })
            .await?;
        tracing::debug!("wrote shared folder {:?} at {}", document.folder, version);
        Ok(version)
    }

    pub(crate) async fn remove_shared(
        &self,
        link: &SharedLink,
        base: Version,
        keys: &KeyPair,
    ) -> Result<(), SyncError> {
        let key = link.document_key();
        let auth = Authorization::sign(keys, &key, base, &[]);
        self.retry
            .run("remove shared folder", || {
                self.dht.remove(&key, base, Some(auth.clone()))
            })
            .await?;
        Ok(())
    }

    /// Rebind an existing shared folder entry to `next`
    pub(crate) async fn protect_shared(
        &self,
        link: &SharedLink,
        base: Version,
        current: &KeyPair,
        next: &KeyPair,
    ) -> Result<Version, SyncError> {
        let key = link.document_key();
        let next = next.public();
        let auth = Authorization::sign(current, &key, base, next.as_bytes());
        Ok(self
            .retry
            .run("protect shared folder", || {
                self.dht.protect(&key, base, next, auth.clone())
            })
            .await?)
    }

    /* Resolution */

    async fn open(&self, entry: Entry) -> Result<UserProfile, SyncError> {
        let plaintext = self.secret.decrypt(&entry.value).map_err(|err| {
            SyncError::ProfileUnavailable(format!(
                "cannot open profile of {}: {}",
                self.user_id(),
                err
            ))
        })?;
        let body = ProfileBody::decode(&plaintext)?;
        let protection_keys = KeyPair::from(body.protection);
        let mut tree = body.tree;
        let root = tree.root_id();
        tree.set_protection(&root, Some(protection_keys.clone()));

        let mut mounts = BTreeMap::new();
        for folder in tree.mount_roots() {
            let Some(link) = tree.get(&folder).and_then(|node| node.shared_link()).cloned() else {
                continue;
            };
            match self.resolve_mount(&body.identity, &link).await {
                Ok(Some((state, subtree))) => {
                    if let Err(err) = tree.replace(&folder, subtree) {
                        tracing::warn!("cannot splice shared folder {:?}: {}", folder, err);
                        tree.set_protection(&folder, None);
                        continue;
                    }
                    tree.set_protection(&folder, state.protection_keys.clone());
                    mounts.insert(folder, state);
                }
                Ok(None) => {
                    tracing::warn!(
                        "shared folder {:?} from {} is no longer available to {}",
                        folder,
                        link.owner,
                        self.user_id()
                    );
                    tree.set_protection(&folder, None);
                }
                Err(err) => {
                    tracing::warn!("cannot open shared folder {:?}: {}", folder, err);
                    tree.set_protection(&folder, None);
                }
            }
        }

        let mut profile = UserProfile::new(
            body.user_id,
            body.identity,
            protection_keys,
            tree,
            entry.version,
        );
        for (folder, state) in mounts {
            profile.insert_mount(folder, state);
        }
        Ok(profile)
    }

    /// Fetch and open the shared document behind `link`. `None` when the
    ///  document is gone or no longer lists this user
    async fn resolve_mount(
        &self,
        identity: &SecretKey,
        link: &SharedLink,
    ) -> Result<Option<(MountState, IndexTree)>, SyncError> {
        let Some((document, version)) = self.read_shared(link).await? else {
            return Ok(None);
        };
        if document.folder != link.folder || !document.members.contains_key(self.user_id()) {
            return Ok(None);
        }
        let (secret, protection_keys, subtree) = document.open(self.user_id(), identity)?;
        let state = MountState {
            link: link.clone(),
            version,
            secret,
            protection_keys,
            protection_public: document.protection,
            members: document.members,
        };
        Ok(Some((state, subtree)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDht;
    use crate::index::{FileIndex, Index};

    fn store(dht: &MemoryDht, user: &str) -> ProfileStore {
        let config = SyncConfig {
            commit_backoff_ms: 1,
            io_backoff_ms: 1,
            ..SyncConfig::default()
        };
        ProfileStore::new(
            Arc::new(dht.clone()),
            UserCredentials::new(user, "password", "0000"),
            config,
        )
    }

    fn empty_file(name: &str) -> Index {
        Index::file(
            name,
            FileIndex {
                size: 0,
                content_hash: crate::crypto::content_hash(b""),
                chunks: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let dht = MemoryDht::new();
        let store = store(&dht, "alice");
        let created = store.create().await.unwrap();
        let read = store.read().await.unwrap();

        assert_eq!(read.version(), created.version());
        assert_eq!(read.identity_public(), created.identity_public());
        assert_eq!(read.tree().len(), 1);
        assert_eq!(
            dht.protection_of(&DhtKey::profile("alice")),
            Some(created.protection_keys().public())
        );
        assert!(dht.contains(&DhtKey::public_key("alice")));
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let dht = MemoryDht::new();
        store(&dht, "alice").create().await.unwrap();
        let err = store(&dht, "alice").create().await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_failed_key_publish_withdraws_profile() {
        let dht = MemoryDht::new();
        let store = store(&dht, "alice");
        let attempts = store.config().io_retries as usize + 1;
        // the profile write goes through, every try at the public key fails
        dht.fail_puts_after(1, attempts);

        let err = store.create().await.unwrap_err();
        assert!(matches!(err, SyncError::IoFailure(_)));
        assert!(!dht.contains(&DhtKey::profile("alice")));
        assert!(!dht.contains(&DhtKey::public_key("alice")));

        dht.clear_faults();
        let profile = store.create().await.unwrap();
        assert_eq!(store.read().await.unwrap().version(), profile.version());
        assert!(dht.contains(&DhtKey::public_key("alice")));
    }

    #[tokio::test]
    async fn test_wrong_credentials_cannot_open() {
        let dht = MemoryDht::new();
        store(&dht, "alice").create().await.unwrap();
        let wrong = ProfileStore::new(
            Arc::new(dht.clone()),
            UserCredentials::new("alice", "password", "9999"),
            SyncConfig::default(),
        );
        assert!(matches!(
            wrong.read().await,
            Err(SyncError::ProfileUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let dht = MemoryDht::new();
        let store = store(&dht, "alice");
        let profile = store.create().await.unwrap();
        let base = profile.version();

        store.write(base, &profile).await.unwrap();
        let err = store.write(base, &profile).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_read_version_returns_history() {
        let dht = MemoryDht::new();
        let store = store(&dht, "alice");
        let first = store.create().await.unwrap();
        store
            .commit(Document::Own, |profile| {
                let root = profile.tree().root_id();
                profile.tree_mut().insert(&root, empty_file("a.txt"))?;
                Ok(())
            })
            .await
            .unwrap();

        let old = store.read_version(first.version()).await.unwrap();
        assert_eq!(old.tree().len(), 1);
        assert_eq!(store.read().await.unwrap().tree().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_commits_all_land() {
        let dht = MemoryDht::new();
        let store = store(&dht, "alice");
        store.create().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .commit(Document::Own, move |profile| {
                        let root = profile.tree().root_id();
                        profile
                            .tree_mut()
                            .insert(&root, empty_file(&format!("file-{}", i)))?;
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let profile = store.read().await.unwrap();
        assert_eq!(profile.tree().len(), 5);
    }

    #[tokio::test]
    async fn test_offline_read_is_unavailable() {
        let dht = MemoryDht::new();
        let store = store(&dht, "alice");
        store.create().await.unwrap();
        dht.set_offline(true);
        assert!(matches!(
            store.read().await,
            Err(SyncError::ProfileUnavailable(_))
        ));
    }
}
