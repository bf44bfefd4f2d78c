use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tempfile::TempDir;

use crate::config::SyncConfig;
use crate::dht::MemoryDht;
use crate::index::{FileId, IndexTree, PermissionType};
use crate::process::Outcome;
use crate::profile::UserCredentials;
use crate::session::Session;

/// One device of one user, with its own temporary sync root
pub struct TestPeer {
    /// The name of this peer (for debugging)
    pub name: String,
    session: Session,
    /// Kept alive for as long as the peer
    root: TempDir,
}

impl TestPeer {
    /// Credentials every test user is registered with
    pub fn credentials(user: &str) -> UserCredentials {
        UserCredentials::new(user, format!("{}-password", user), "0000")
    }

    /// Register `user` and open a session for them
    pub async fn register(
        name: &str,
        user: &str,
        dht: &MemoryDht,
        config: SyncConfig,
    ) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let dht = Arc::new(dht.clone());
        let session =
            Session::register(dht, Self::credentials(user), root.path(), config).await?;
        tracing::info!("[{}] registered {} at {}", name, user, root.path().display());
        Ok(Self {
            name: name.to_string(),
            session,
            root,
        })
    }

    /// Log an already registered `user` in on a new device
    pub async fn login(name: &str, user: &str, dht: &MemoryDht, config: SyncConfig) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let dht = Arc::new(dht.clone());
        let session = Session::login(dht, Self::credentials(user), root.path(), config).await?;
        tracing::info!("[{}] logged in as {}", name, user);
        Ok(Self {
            name: name.to_string(),
            session,
            root,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn user_id(&self) -> &str {
        self.session.user_id()
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Where tree path `path` lives under this peer's root
    pub fn local_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.session.context().local_path(path.as_ref())
    }

    /// The resolved tree as this peer sees it now
    pub async fn tree(&self) -> Result<IndexTree> {
        Ok(self.session.profile().await?.tree().clone())
    }

    pub async fn file_id(&self, path: impl AsRef<Path>) -> Result<FileId> {
        Ok(self.session.file_id(path).await?)
    }

    /* Local files */

    pub async fn write_file(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let local = self.local_path(path);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, data).await?;
        Ok(())
    }

    /// Write `size` random bytes to `path` and return them
    pub async fn write_random_file(&self, path: impl AsRef<Path>, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size];
        rand::rng().fill(&mut data[..]);
        self.write_file(path, &data).await?;
        Ok(data)
    }

    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.local_path(path)).await?)
    }

    pub async fn create_dir(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::create_dir_all(self.local_path(path)).await?;
        Ok(())
    }

    /* Processes, run to completion */

    /// Write random content locally and upload it
    pub async fn upload_random(&self, path: impl AsRef<Path>, size: usize) -> Result<Vec<u8>> {
        let path = path.as_ref().to_path_buf();
        let data = self.write_random_file(&path, size).await?;
        self.session
            .run(|session| session.upload_file(path.clone()))
            .await?;
        Ok(data)
    }

    pub async fn upload_folder(&self, path: impl AsRef<Path>) -> Result<Outcome> {
        let path = path.as_ref().to_path_buf();
        self.create_dir(&path).await?;
        Ok(self
            .session
            .run(|session| session.upload_folder(path.clone()))
            .await?)
    }

    /// Download the file at tree path `path` into this peer's root
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<Outcome> {
        let id = self.file_id(path).await?;
        Ok(self.session.run(|session| session.download(id)).await?)
    }

    pub async fn share(
        &self,
        path: impl AsRef<Path>,
        user: &str,
        permission: PermissionType,
    ) -> Result<Outcome> {
        let path = path.as_ref().to_path_buf();
        Ok(self
            .session
            .run(|session| session.share(path.clone(), user, permission))
            .await?)
    }

    pub async fn accept_shares(&self) -> Result<Outcome> {
        Ok(self.session.run(|session| session.accept_shares()).await?)
    }
}
