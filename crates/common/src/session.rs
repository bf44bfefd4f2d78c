use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::dht::DhtStore;
use crate::error::SyncError;
use crate::index::{FileId, PermissionType};
use crate::process::{Outcome, Process};
use crate::profile::{ProfileStore, UserCredentials, UserProfile};
use crate::sync::{
    delete, download, relocate, share, upload, EventReceiver, FileEvent, SyncContext,
};

/**
 * Session
 * =======
 * A logged in user on one peer: the profile store plus the local sync
 *  root. Every operation comes out of here as a [`Process`] that the
 *  caller can start, listen to, pause or cancel.
 * [`Session::run`] is the convenience path: it builds and runs a process,
 *  and rebuilds it from scratch when it lost a version race for good.
 */
#[derive(Debug, Clone)]
pub struct Session {
    ctx: SyncContext,
}

impl Session {
    /// Create the user's profile and open a session on it
    pub async fn register(
        dht: Arc<dyn DhtStore>,
        credentials: UserCredentials,
        root: impl Into<PathBuf>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let store = ProfileStore::new(dht, credentials, config);
        store.create().await?;
        tracing::info!("registered {}", store.user_id());
        Ok(Self {
            ctx: SyncContext::new(store, root),
        })
    }

    /// Open a session on an existing profile
    ///
    /// Fails with `ProfileUnavailable` when the credentials do not open it.
    pub async fn login(
        dht: Arc<dyn DhtStore>,
        credentials: UserCredentials,
        root: impl Into<PathBuf>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let store = ProfileStore::new(dht, credentials, config);
        let profile = store.read().await?;
        tracing::info!(
            "{} logged in at profile version {}",
            store.user_id(),
            profile.version()
        );
        Ok(Self {
            ctx: SyncContext::new(store, root),
        })
    }

    pub fn user_id(&self) -> &str {
        self.ctx.user_id()
    }

    pub fn root(&self) -> &Path {
        self.ctx.root()
    }

    pub fn store(&self) -> &ProfileStore {
        self.ctx.store()
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn config(&self) -> &SyncConfig {
        self.ctx.config()
    }

    /// The latest resolved profile
    pub async fn profile(&self) -> Result<UserProfile, SyncError> {
        self.ctx.store().read().await
    }

    /// Id of the node at tree path `path`
    pub async fn file_id(&self, path: impl AsRef<Path>) -> Result<FileId, SyncError> {
        self.profile().await?.resolve(path.as_ref())
    }

    /* Process factory */

    pub fn upload_file(&self, path: impl Into<PathBuf>) -> Process {
        upload::upload_file(&self.ctx, path)
    }

    pub fn upload_folder(&self, path: impl Into<PathBuf>) -> Process {
        upload::upload_folder(&self.ctx, path)
    }

    pub fn update_file(&self, path: impl Into<PathBuf>) -> Process {
        upload::update_file(&self.ctx, path)
    }

    pub fn download(&self, id: FileId) -> Process {
        download::download(&self.ctx, id)
    }

    pub fn move_node(&self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Process {
        relocate::move_node(&self.ctx, from, to)
    }

    pub fn delete(&self, path: impl Into<PathBuf>) -> Process {
        delete::delete(&self.ctx, path)
    }

    pub fn share(
        &self,
        path: impl Into<PathBuf>,
        grantee: impl Into<String>,
        permission: PermissionType,
    ) -> Process {
        share::share(&self.ctx, path, grantee, permission)
    }

    pub fn accept_shares(&self) -> Process {
        share::accept_shares(&self.ctx)
    }

    /// Plan a download of everything missing under the local root
    pub async fn synchronize(&self) -> Result<Process, SyncError> {
        download::synchronize(&self.ctx).await
    }

    /* Running */

    /// Build and run a process, rebuilding it on a lost version race
    ///
    /// Each attempt starts from a fresh build, so validation sees the
    /// profile as it is now. Gives up after `process_retries` reruns.
    pub async fn run<F>(&self, build: F) -> Result<Outcome, SyncError>
    where
        F: Fn(&Session) -> Process,
    {
        let retries = self.config().process_retries;
        let mut attempt = 0;
        loop {
            let process = build(self);
            let name = process.name().to_string();
            match process.run().await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_conflict() && attempt < retries => {
                    attempt += 1;
                    tracing::info!(
                        "rerunning {} after a version conflict ({}/{})",
                        name,
                        attempt,
                        retries
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Map one watcher event onto the matching process and run it
    pub async fn handle_event(&self, event: &FileEvent) -> Result<Outcome, SyncError> {
        match event {
            FileEvent::Created(local) => {
                let path = self.ctx.tree_path(local)?;
                let is_dir = tokio::fs::metadata(local).await?.is_dir();
                if is_dir {
                    self.run(|session| session.upload_folder(path.clone())).await
                } else {
                    self.run(|session| session.upload_file(path.clone())).await
                }
            }
            FileEvent::Modified(local) => {
                let path = self.ctx.tree_path(local)?;
                if tokio::fs::metadata(local).await?.is_dir() {
                    return Ok(Outcome::NoOp);
                }
                self.run(|session| session.update_file(path.clone())).await
            }
            FileEvent::Moved { from, to } => {
                let from = self.ctx.tree_path(from)?;
                let to = self.ctx.tree_path(to)?;
                self.run(|session| session.move_node(from.clone(), to.clone()))
                    .await
            }
            FileEvent::Deleted(local) => {
                let path = self.ctx.tree_path(local)?;
                self.run(|session| session.delete(path.clone())).await
            }
        }
    }

    /// Drain `receiver` on a background task, one event at a time
    ///
    /// The task ends once every dispatcher is dropped. Failed events are
    /// logged and skipped.
    pub fn spawn_event_worker(&self, receiver: EventReceiver) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            tracing::info!("event worker for {} started", session.user_id());
            while let Some(event) = receiver.recv().await {
                match session.handle_event(&event).await {
                    Ok(outcome) => tracing::debug!("handled {:?}: {:?}", event, outcome),
                    Err(err) => tracing::warn!("could not handle {:?}: {}", event, err),
                }
            }
            tracing::info!("event worker for {} stopped", session.user_id());
        })
    }
}
