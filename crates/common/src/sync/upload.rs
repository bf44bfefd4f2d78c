//! Upload of new files and folders, and update of modified files

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::content::{self, SealedChunk};
use super::{describe, keys_of, require_write, split_path, SyncContext};
use crate::crypto::{content_hash, KeyPair};
use crate::error::SyncError;
use crate::index::{FileId, FileIndex, Index};
use crate::process::{Outcome, OutcomeCell, Process, ProcessComponent, Step};
use crate::profile::Document;

#[derive(Default)]
struct UploadState {
    noop: bool,
    document: Option<Document>,
    keys: Option<KeyPair>,
    /// Where a new node goes
    parent: Option<FileId>,
    name: String,
    /// New content, `None` when creating a folder
    file: Option<FileIndex>,
    sealed: Vec<SealedChunk>,
    created: Option<FileId>,
    /// The file an update replaces content of
    target: Option<FileId>,
    previous: Option<FileIndex>,
    removed: Vec<SealedChunk>,
}

type State = Arc<Mutex<UploadState>>;

/// Upload a local file that the tree does not know yet
pub fn upload_file(ctx: &SyncContext, path: impl Into<PathBuf>) -> Process {
    let path = path.into();
    let state = State::default();
    let outcome = OutcomeCell::default();
    let proceed = state.clone();

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ValidateUpload {
            ctx: ctx.clone(),
            path: path.clone(),
            folder: false,
            state: state.clone(),
            outcome: outcome.clone(),
        }),
        ProcessComponent::decision(
            move || !proceed.lock().noop,
            ProcessComponent::sequence([
                ProcessComponent::step(PutChunks {
                    ctx: ctx.clone(),
                    state: state.clone(),
                }),
                ProcessComponent::step(CommitInsert {
                    ctx: ctx.clone(),
                    state,
                }),
            ]),
            ProcessComponent::nothing(),
        ),
    ]);
    Process::new(format!("upload {}", path.display()), root)
        .with_outcome(outcome)
        .with_timeout(ctx.config().process_timeout())
}

/// Create an empty folder node
pub fn upload_folder(ctx: &SyncContext, path: impl Into<PathBuf>) -> Process {
    let path = path.into();
    let state = State::default();
    let outcome = OutcomeCell::default();
    let proceed = state.clone();

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ValidateUpload {
            ctx: ctx.clone(),
            path: path.clone(),
            folder: true,
            state: state.clone(),
            outcome: outcome.clone(),
        }),
        ProcessComponent::decision(
            move || !proceed.lock().noop,
            ProcessComponent::step(CommitInsert {
                ctx: ctx.clone(),
                state,
            }),
            ProcessComponent::nothing(),
        ),
    ]);
    Process::new(format!("create folder {}", path.display()), root)
        .with_outcome(outcome)
        .with_timeout(ctx.config().process_timeout())
}

/// Replace a known file's content with the local copy
pub fn update_file(ctx: &SyncContext, path: impl Into<PathBuf>) -> Process {
    let path = path.into();
    let state = State::default();
    let outcome = OutcomeCell::default();
    let proceed = state.clone();

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ValidateUpdate {
            ctx: ctx.clone(),
            path: path.clone(),
            state: state.clone(),
            outcome: outcome.clone(),
        }),
        ProcessComponent::decision(
            move || !proceed.lock().noop,
            ProcessComponent::sequence([
                ProcessComponent::step(PutChunks {
                    ctx: ctx.clone(),
                    state: state.clone(),
                }),
                ProcessComponent::step(CommitReplace {
                    ctx: ctx.clone(),
                    state: state.clone(),
                }),
                ProcessComponent::step(RemoveOldChunks {
                    ctx: ctx.clone(),
                    state,
                }),
            ]),
            ProcessComponent::nothing(),
        ),
    ]);
    Process::new(format!("update {}", path.display()), root)
        .with_outcome(outcome)
        .with_timeout(ctx.config().process_timeout())
}

struct ValidateUpload {
    ctx: SyncContext,
    path: PathBuf,
    folder: bool,
    state: State,
    outcome: OutcomeCell,
}

#[async_trait]
impl Step for ValidateUpload {
    fn name(&self) -> &str {
        "validate upload"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let profile = self.ctx.store().read().await?;
        let tree = profile.tree();
        let user_id = self.ctx.user_id();
        let (parent_path, name) = split_path(&self.path)?;

        let parent = tree.resolve(&parent_path).ok_or_else(|| {
            SyncError::NotFound(format!("folder /{}", parent_path.display()))
        })?;
        if !tree.node(&parent)?.is_folder() {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} is not a folder",
                describe(tree, &parent)
            )));
        }
        require_write(tree, &parent, user_id)?;
        let keys = keys_of(tree, &parent, user_id)?;

        let existing = tree.child(&parent, &name).and_then(|id| tree.get(&id));
        let (file, sealed) = if self.folder {
            if let Some(existing) = existing {
                if existing.is_folder() {
                    return self.noop();
                }
                return Err(SyncError::AlreadyExists(format!("/{}", self.path.display())));
            }
            (None, Vec::new())
        } else {
            let data = tokio::fs::read(self.ctx.local_path(&self.path)).await?;
            if let Some(existing) = existing {
                match existing.as_file() {
                    Some(file) if file.content_hash == content_hash(&data) => {
                        return self.noop();
                    }
                    _ => {
                        return Err(SyncError::AlreadyExists(format!(
                            "/{}",
                            self.path.display()
                        )))
                    }
                }
            }
            let (file, sealed) = content::seal(&data, self.ctx.config().chunk_size)?;
            (Some(file), sealed)
        };

        let mut state = self.state.lock();
        state.document = Some(profile.document_of(&parent));
        state.keys = Some(keys);
        state.parent = Some(parent);
        state.name = name;
        state.file = file;
        state.sealed = sealed;
        Ok(())
    }
}

impl ValidateUpload {
    fn noop(&self) -> Result<(), SyncError> {
        tracing::info!("/{} is already up to date", self.path.display());
        self.state.lock().noop = true;
        self.outcome.set(Outcome::NoOp);
        Ok(())
    }
}

/// Put the sealed chunks under the target's protection keys
struct PutChunks {
    ctx: SyncContext,
    state: State,
}

impl PutChunks {
    fn material(&self) -> Result<(Vec<SealedChunk>, KeyPair), SyncError> {
        let state = self.state.lock();
        let keys = state
            .keys
            .clone()
            .ok_or_else(|| SyncError::PermissionDenied("no protection keys".into()))?;
        Ok((state.sealed.clone(), keys))
    }
}

#[async_trait]
impl Step for PutChunks {
    fn name(&self) -> &str {
        "put chunks"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let (sealed, keys) = self.material()?;
        content::put_chunks(self.ctx.dht().as_ref(), self.ctx.retry(), &sealed, &keys).await
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let (sealed, keys) = self.material()?;
        let stored: Vec<_> = sealed.iter().map(|chunk| chunk.key).collect();
        content::remove_chunks(self.ctx.dht().as_ref(), self.ctx.retry(), &stored, &keys).await?;
        Ok(())
    }
}

/// Add the new node to its parent's document
struct CommitInsert {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for CommitInsert {
    fn name(&self) -> &str {
        "commit insert"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let (document, parent, name, file) = {
            let state = self.state.lock();
            (state.document, state.parent, state.name.clone(), state.file.clone())
        };
        let (Some(document), Some(parent)) = (document, parent) else {
            return Err(SyncError::NotFound("upload target".into()));
        };
        let user_id = self.ctx.user_id().to_string();

        let profile = self
            .ctx
            .store()
            .commit(document, |profile| {
                let tree = profile.tree_mut();
                require_write(tree, &parent, &user_id)?;
                let index = match &file {
                    Some(file) => Index::file(&name, file.clone()),
                    None => Index::folder(&name),
                };
                tree.insert(&parent, index)?;
                Ok(())
            })
            .await?;

        self.state.lock().created = profile.tree().child(&parent, &name);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let (document, created) = {
            let state = self.state.lock();
            (state.document, state.created)
        };
        let (Some(document), Some(created)) = (document, created) else {
            return Ok(());
        };
        self.ctx
            .store()
            .commit(document, |profile| {
                if profile.tree().contains(&created) {
                    profile.tree_mut().detach(&created)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

struct ValidateUpdate {
    ctx: SyncContext,
    path: PathBuf,
    state: State,
    outcome: OutcomeCell,
}

#[async_trait]
impl Step for ValidateUpdate {
    fn name(&self) -> &str {
        "validate update"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let profile = self.ctx.store().read().await?;
        let tree = profile.tree();
        let user_id = self.ctx.user_id();

        let id = profile.resolve(&self.path)?;
        let current = tree
            .node(&id)?
            .as_file()
            .cloned()
            .ok_or_else(|| {
                SyncError::IllegalFileLocation(format!("/{} is a folder", self.path.display()))
            })?;
        require_write(tree, &id, user_id)?;
        let keys = keys_of(tree, &id, user_id)?;

        let data = tokio::fs::read(self.ctx.local_path(&self.path)).await?;
        if content_hash(&data) == current.content_hash {
            tracing::info!("/{} is unchanged", self.path.display());
            self.state.lock().noop = true;
            self.outcome.set(Outcome::NoOp);
            return Ok(());
        }
        let (file, sealed) = content::seal(&data, self.ctx.config().chunk_size)?;

        let mut state = self.state.lock();
        state.document = Some(profile.document_of(&id));
        state.keys = Some(keys);
        state.target = Some(id);
        state.file = Some(file);
        state.sealed = sealed;
        Ok(())
    }
}

/// Point the file at its new chunks, remembering the old ones
struct CommitReplace {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for CommitReplace {
    fn name(&self) -> &str {
        "commit replace"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let (document, target, file) = {
            let state = self.state.lock();
            (state.document, state.target, state.file.clone())
        };
        let (Some(document), Some(target), Some(file)) = (document, target, file) else {
            return Err(SyncError::NotFound("update target".into()));
        };
        let user_id = self.ctx.user_id().to_string();

        let mut previous = None;
        self.ctx
            .store()
            .commit(document, |profile| {
                require_write(profile.tree(), &target, &user_id)?;
                previous = Some(profile.tree_mut().set_content(&target, file.clone())?);
                Ok(())
            })
            .await?;
        self.state.lock().previous = previous;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let (document, target, previous) = {
            let state = self.state.lock();
            (state.document, state.target, state.previous.clone())
        };
        let (Some(document), Some(target), Some(previous)) = (document, target, previous) else {
            return Ok(());
        };
        self.ctx
            .store()
            .commit(document, |profile| {
                if profile.tree().contains(&target) {
                    profile.tree_mut().set_content(&target, previous.clone())?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Drop the chunks the update made unreachable
struct RemoveOldChunks {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for RemoveOldChunks {
    fn name(&self) -> &str {
        "remove old chunks"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let (previous, keys) = {
            let state = self.state.lock();
            (state.previous.clone(), state.keys.clone())
        };
        let (Some(previous), Some(keys)) = (previous, keys) else {
            return Ok(());
        };
        let stale = content::chunk_keys([&previous]);
        let removed =
            content::remove_chunks(self.ctx.dht().as_ref(), self.ctx.retry(), &stale, &keys)
                .await?;
        self.state.lock().removed = removed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let (removed, keys) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.removed), state.keys.clone())
        };
        let Some(keys) = keys else {
            return Ok(());
        };
        content::put_chunks(self.ctx.dht().as_ref(), self.ctx.retry(), &removed, &keys).await
    }
}
