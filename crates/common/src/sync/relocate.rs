//! Move and rename
//!
//! A move inside one document is a single commit. A move between documents
//! (into or out of a shared folder) also hands the node's content from the
//! source document's protection keys to the destination's: the node is cut
//! from the source, grafted into the destination, and its chunks are
//! re-protected before the commits when the audience grows, after them
//! when it shrinks.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::content;
use super::{describe, keys_of, require_write, split_path, SyncContext};
use crate::crypto::KeyPair;
use crate::dht::DhtKey;
use crate::error::SyncError;
use crate::index::{FileId, IndexTree};
use crate::process::{Process, ProcessComponent, Step};
use crate::profile::Document;

#[derive(Clone)]
struct Plan {
    id: FileId,
    source_parent: FileId,
    source_name: String,
    dest_parent: FileId,
    dest_name: String,
    source_doc: Document,
    dest_doc: Document,
    /// Set for moves between documents
    handover: Option<Handover>,
}

#[derive(Clone)]
struct Handover {
    from: KeyPair,
    to: KeyPair,
    chunks: Vec<DhtKey>,
    grows: bool,
}

#[derive(Default)]
struct MoveState {
    plan: Option<Plan>,
    detached: Option<IndexTree>,
}

type State = Arc<Mutex<MoveState>>;

fn plan(state: &State) -> Result<Plan, SyncError> {
    state
        .lock()
        .plan
        .clone()
        .ok_or_else(|| SyncError::NotFound("move plan".into()))
}

/// Move the node at `from` to `to`, renaming it to `to`'s final component
pub fn move_node(ctx: &SyncContext, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Process {
    let from = from.into();
    let to = to.into();
    let state = State::default();
    let within = state.clone();
    let grows = state.clone();

    let step = |kind: MoveStep| {
        ProcessComponent::step(MoveStepImpl {
            ctx: ctx.clone(),
            kind,
            state: state.clone(),
        })
    };

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ValidateMove {
            ctx: ctx.clone(),
            from: from.clone(),
            to: to.clone(),
            state: state.clone(),
        }),
        ProcessComponent::decision(
            move || {
                within
                    .lock()
                    .plan
                    .as_ref()
                    .is_some_and(|plan| plan.handover.is_none())
            },
            step(MoveStep::Relocate),
            ProcessComponent::decision(
                move || {
                    grows
                        .lock()
                        .plan
                        .as_ref()
                        .and_then(|plan| plan.handover.as_ref())
                        .is_some_and(|handover| handover.grows)
                },
                ProcessComponent::sequence([
                    step(MoveStep::Reprotect),
                    step(MoveStep::Detach),
                    step(MoveStep::Graft),
                ]),
                ProcessComponent::sequence([
                    step(MoveStep::Detach),
                    step(MoveStep::Graft),
                    step(MoveStep::Reprotect),
                ]),
            ),
        ),
    ]);
    Process::new(format!("move {} to {}", from.display(), to.display()), root)
        .with_timeout(ctx.config().process_timeout())
}

struct ValidateMove {
    ctx: SyncContext,
    from: PathBuf,
    to: PathBuf,
    state: State,
}

#[async_trait]
impl Step for ValidateMove {
    fn name(&self) -> &str {
        "validate move"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let profile = self.ctx.store().read().await?;
        let tree = profile.tree();
        let user_id = self.ctx.user_id();

        let id = profile.resolve(&self.from)?;
        let node = tree.node(&id)?;
        let Some(source_parent) = node.parent() else {
            return Err(SyncError::IllegalFileLocation(
                "the root folder cannot be moved".into(),
            ));
        };
        let (dest_path, dest_name) = split_path(&self.to)?;
        let dest_parent = tree
            .resolve(&dest_path)
            .ok_or_else(|| SyncError::NotFound(format!("folder /{}", dest_path.display())))?;

        if !tree.node(&dest_parent)?.is_folder() {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} is not a folder",
                describe(tree, &dest_parent)
            )));
        }
        if tree.is_within(&dest_parent, &id) {
            return Err(SyncError::IllegalFileLocation(format!(
                "cannot move {} into itself",
                describe(tree, &id)
            )));
        }
        if tree.child(&dest_parent, &dest_name).is_some() {
            return Err(SyncError::AlreadyExists(format!("/{}", self.to.display())));
        }
        require_write(tree, &id, user_id)?;
        require_write(tree, &source_parent, user_id)?;
        if !tree.can_write(&dest_parent, user_id) {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} cannot write the destination {}",
                user_id,
                describe(tree, &dest_parent)
            )));
        }

        let source_doc = profile.document_of(&source_parent);
        let dest_doc = profile.document_of(&dest_parent);
        let handover = if source_doc == dest_doc {
            None
        } else {
            let nests = node.shared_link().is_some() || tree.contains_mount_below(&id);
            if matches!(dest_doc, Document::Shared(_)) && nests {
                return Err(SyncError::IllegalFileLocation(format!(
                    "{} contains a shared folder and cannot move into another",
                    describe(tree, &id)
                )));
            }
            let from = keys_of(tree, &source_parent, user_id)?;
            let to = keys_of(tree, &dest_parent, user_id)?;
            let files = tree.files_in(&id);
            let chunks = content::chunk_keys(files.iter().filter_map(|node| node.as_file()));
            let before = tree.calculated_user_list(&source_parent);
            let after = tree.calculated_user_list(&dest_parent);
            Some(Handover {
                from,
                to,
                chunks,
                grows: after.difference(&before).next().is_some(),
            })
        };

        tracing::debug!(
            "move {} -> {}: {:?} to {:?}",
            self.from.display(),
            self.to.display(),
            source_doc,
            dest_doc
        );
        self.state.lock().plan = Some(Plan {
            id,
            source_parent,
            source_name: node.name().to_string(),
            dest_parent,
            dest_name,
            source_doc,
            dest_doc,
            handover,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum MoveStep {
    /// Same document: one relocating commit
    Relocate,
    /// Cut the node out of the source document
    Detach,
    /// Hang the cut subtree into the destination document
    Graft,
    /// Rebind the content to the destination's keys
    Reprotect,
}

struct MoveStepImpl {
    ctx: SyncContext,
    kind: MoveStep,
    state: State,
}

impl MoveStepImpl {
    async fn relocate(&self, plan: &Plan, forward: bool) -> Result<(), SyncError> {
        let user_id = self.ctx.user_id().to_string();
        let (parent, name) = if forward {
            (plan.dest_parent, plan.dest_name.as_str())
        } else {
            (plan.source_parent, plan.source_name.as_str())
        };
        self.ctx
            .store()
            .commit(plan.source_doc, |profile| {
                let tree = profile.tree_mut();
                if forward {
                    require_write(tree, &plan.id, &user_id)?;
                    require_write(tree, &plan.source_parent, &user_id)?;
                    if !tree.can_write(&plan.dest_parent, &user_id) {
                        return Err(SyncError::IllegalFileLocation(format!(
                            "{} cannot write the destination",
                            user_id
                        )));
                    }
                }
                tree.relocate(&plan.id, &parent, name)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn detach(&self, plan: &Plan) -> Result<(), SyncError> {
        let mut detached = None;
        self.ctx
            .store()
            .commit(plan.source_doc, |profile| {
                detached = Some(profile.tree_mut().detach(&plan.id)?);
                Ok(())
            })
            .await?;
        self.state.lock().detached = detached;
        Ok(())
    }

    /// Graft the detached subtree under `parent` in `document`
    async fn graft(
        &self,
        document: Document,
        parent: FileId,
        name: &str,
    ) -> Result<(), SyncError> {
        let subtree = self
            .state
            .lock()
            .detached
            .clone()
            .ok_or_else(|| SyncError::NotFound("detached subtree".into()))?;
        let id = subtree.root_id();
        self.ctx
            .store()
            .commit(document, |profile| {
                if profile.tree().contains(&id) {
                    return Ok(());
                }
                let keys = profile
                    .tree()
                    .node(&parent)?
                    .protection_keys()
                    .cloned();
                let tree = profile.tree_mut();
                tree.graft(&parent, name, subtree.clone())?;
                tree.set_protection(&id, keys);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn ungraft(&self, document: Document, id: FileId) -> Result<(), SyncError> {
        self.ctx
            .store()
            .commit(document, |profile| {
                if profile.tree().contains(&id) {
                    profile.tree_mut().detach(&id)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reprotect(&self, handover: &Handover, forward: bool) -> Result<(), SyncError> {
        let (from, to) = if forward {
            (&handover.from, &handover.to)
        } else {
            (&handover.to, &handover.from)
        };
        content::reprotect(
            self.ctx.dht().as_ref(),
            self.ctx.retry(),
            &handover.chunks,
            from,
            to,
        )
        .await
    }
}

#[async_trait]
impl Step for MoveStepImpl {
    fn name(&self) -> &str {
        match self.kind {
            MoveStep::Relocate => "commit relocate",
            MoveStep::Detach => "commit detach from source",
            MoveStep::Graft => "commit graft into destination",
            MoveStep::Reprotect => "re-protect content",
        }
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        match self.kind {
            MoveStep::Relocate => self.relocate(&plan, true).await,
            MoveStep::Detach => self.detach(&plan).await,
            MoveStep::Graft => {
                self.graft(plan.dest_doc, plan.dest_parent, &plan.dest_name)
                    .await
            }
            MoveStep::Reprotect => match &plan.handover {
                Some(handover) => self.reprotect(handover, true).await,
                None => Ok(()),
            },
        }
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        match self.kind {
            MoveStep::Relocate => self.relocate(&plan, false).await,
            MoveStep::Detach => {
                self.graft(plan.source_doc, plan.source_parent, &plan.source_name)
                    .await
            }
            MoveStep::Graft => self.ungraft(plan.dest_doc, plan.id).await,
            MoveStep::Reprotect => match &plan.handover {
                Some(handover) => self.reprotect(handover, false).await,
                None => Ok(()),
            },
        }
    }
}
