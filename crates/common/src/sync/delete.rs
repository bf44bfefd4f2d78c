use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::content::{self, SealedChunk};
use super::{describe, keys_of, require_write, SyncContext};
use crate::crypto::KeyPair;
use crate::dht::{DhtKey, Version};
use crate::error::SyncError;
use crate::index::{FileId, IndexTree, SharedLink};
use crate::process::{Process, ProcessComponent, Step};
use crate::profile::{Document, SharedFolderDocument};

#[derive(Clone)]
struct Plan {
    id: FileId,
    parent: FileId,
    name: String,
    document: Document,
    /// Chunks to drop, grouped by the keys that guard them
    content: Vec<(KeyPair, Vec<DhtKey>)>,
    /// Set when deleting the root of a shared folder this user owns
    owned_share: Option<(SharedLink, KeyPair)>,
}

#[derive(Default)]
struct DeleteState {
    plan: Option<Plan>,
    detached: Option<IndexTree>,
    removed: Vec<(KeyPair, Vec<SealedChunk>)>,
    removed_document: Option<SharedFolderDocument>,
}

type State = Arc<Mutex<DeleteState>>;

fn plan(state: &State) -> Result<Plan, SyncError> {
    state
        .lock()
        .plan
        .clone()
        .ok_or_else(|| SyncError::NotFound("delete plan".into()))
}

/// Remove the node at `path` and everything below it
///
/// Deleting the mount of someone else's shared folder only unmounts it.
pub fn delete(ctx: &SyncContext, path: impl Into<PathBuf>) -> Process {
    let path = path.into();
    let state = State::default();
    let has_content = state.clone();
    let owns_share = state.clone();

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ValidateDelete {
            ctx: ctx.clone(),
            path: path.clone(),
            state: state.clone(),
        }),
        ProcessComponent::step(CommitRemove {
            ctx: ctx.clone(),
            state: state.clone(),
        }),
        ProcessComponent::decision(
            move || {
                has_content
                    .lock()
                    .plan
                    .as_ref()
                    .is_some_and(|plan| !plan.content.is_empty())
            },
            ProcessComponent::step(RemoveContent {
                ctx: ctx.clone(),
                state: state.clone(),
            }),
            ProcessComponent::nothing(),
        ),
        ProcessComponent::decision(
            move || {
                owns_share
                    .lock()
                    .plan
                    .as_ref()
                    .is_some_and(|plan| plan.owned_share.is_some())
            },
            ProcessComponent::step(RemoveSharedDocument {
                ctx: ctx.clone(),
                state,
            }),
            ProcessComponent::nothing(),
        ),
    ]);
    Process::new(format!("delete {}", path.display()), root)
        .with_timeout(ctx.config().process_timeout())
}

struct ValidateDelete {
    ctx: SyncContext,
    path: PathBuf,
    state: State,
}

#[async_trait]
impl Step for ValidateDelete {
    fn name(&self) -> &str {
        "validate delete"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let profile = self.ctx.store().read().await?;
        let tree = profile.tree();
        let user_id = self.ctx.user_id();

        let id = profile.resolve(&self.path)?;
        let node = tree.node(&id)?;
        let Some(parent) = node.parent() else {
            return Err(SyncError::IllegalFileLocation(
                "the root folder cannot be deleted".into(),
            ));
        };
        if tree.contains_mount_below(&id) {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} contains a shared folder",
                describe(tree, &id)
            )));
        }

        let foreign_mount = node
            .shared_link()
            .is_some_and(|link| link.owner != user_id);
        require_write(tree, &parent, user_id)?;

        let mut content: Vec<(KeyPair, Vec<DhtKey>)> = Vec::new();
        let mut owned_share = None;
        if !foreign_mount {
            require_write(tree, &id, user_id)?;
            for file in tree.files_in(&id) {
                let keys = keys_of(tree, &file.id(), user_id)?;
                let chunks = file
                    .as_file()
                    .map(|file| content::chunk_keys([file]))
                    .unwrap_or_default();
                match content
                    .iter_mut()
                    .find(|(group, _)| group.public() == keys.public())
                {
                    Some((_, group)) => group.extend(chunks),
                    None => content.push((keys, chunks)),
                }
            }
            if let Some(link) = node.shared_link() {
                let keys = profile
                    .mount(&id)
                    .and_then(|mount| mount.protection_keys.clone());
                match keys {
                    Some(keys) => owned_share = Some((link.clone(), keys)),
                    None => tracing::warn!(
                        "shared folder {} is not mounted, leaving its document",
                        describe(tree, &id)
                    ),
                }
            }
        }

        self.state.lock().plan = Some(Plan {
            id,
            parent,
            name: node.name().to_string(),
            document: profile.document_of(&parent),
            content,
            owned_share,
        });
        Ok(())
    }
}

struct CommitRemove {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for CommitRemove {
    fn name(&self) -> &str {
        "commit remove"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let user_id = self.ctx.user_id().to_string();
        let mut detached = None;
        self.ctx
            .store()
            .commit(plan.document, |profile| {
                require_write(profile.tree(), &plan.parent, &user_id)?;
                detached = Some(profile.tree_mut().detach(&plan.id)?);
                profile.remove_mount(&plan.id);
                Ok(())
            })
            .await?;
        self.state.lock().detached = detached;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let Some(subtree) = self.state.lock().detached.clone() else {
            return Ok(());
        };
        self.ctx
            .store()
            .commit(plan.document, |profile| {
                if profile.tree().contains(&plan.id) {
                    return Ok(());
                }
                let keys = profile
                    .tree()
                    .node(&plan.parent)?
                    .protection_keys()
                    .cloned();
                let tree = profile.tree_mut();
                tree.graft(&plan.parent, &plan.name, subtree.clone())?;
                tree.set_protection(&plan.id, keys);
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Drop the chunks, keeping the ciphertext until the process is over
struct RemoveContent {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for RemoveContent {
    fn name(&self) -> &str {
        "remove content"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let dht = self.ctx.dht().as_ref();
        let mut removed = Vec::new();
        for (keys, chunks) in &plan.content {
            match content::remove_chunks(dht, self.ctx.retry(), chunks, keys).await {
                Ok(group) => removed.push((keys.clone(), group)),
                Err(err) => {
                    for (keys, group) in &removed {
                        if let Err(restore) =
                            content::put_chunks(dht, self.ctx.retry(), group, keys).await
                        {
                            tracing::warn!("could not restore removed chunks: {}", restore);
                        }
                    }
                    return Err(err);
                }
            }
        }
        self.state.lock().removed = removed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let removed = std::mem::take(&mut self.state.lock().removed);
        for (keys, group) in &removed {
            content::put_chunks(self.ctx.dht().as_ref(), self.ctx.retry(), group, keys).await?;
        }
        Ok(())
    }
}

struct RemoveSharedDocument {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for RemoveSharedDocument {
    fn name(&self) -> &str {
        "remove shared folder document"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let Some((link, keys)) = &plan.owned_share else {
            return Ok(());
        };
        let Some((document, version)) = self.ctx.store().read_shared(link).await? else {
            return Ok(());
        };
        self.ctx.store().remove_shared(link, version, keys).await?;
        tracing::info!("removed shared folder document {:?}", link.folder);
        self.state.lock().removed_document = Some(document);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let document = self.state.lock().removed_document.take();
        let (Some((_, keys)), Some(document)) = (&plan.owned_share, document) else {
            return Ok(());
        };
        self.ctx
            .store()
            .put_shared(Version::ZERO, &document, keys)
            .await?;
        Ok(())
    }
}
