//! Sharing folders with other users and mounting what others shared
//!
//! Sharing moves a folder's subtree out of the owner's profile into a
//! shared folder document of its own. Every share, including a re-share of
//! an already shared folder, rotates the folder's protection keys, so a
//! member who lost WRITE can no longer sign for its content.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::content;
use super::{describe, keys_of, require_write, SyncContext};
use crate::crypto::{ContentHash, KeyPair, Secret};
use crate::dht::{DhtKey, Version};
use crate::error::SyncError;
use crate::index::{FileId, Index, IndexTree, PermissionType, SharedLink};
use crate::process::{Outcome, OutcomeCell, Process, ProcessComponent, Step};
use crate::profile::{Document, Invitation, MemberShare, SharedFolderDocument};

#[derive(Clone)]
struct SharePlan {
    folder: FileId,
    link: SharedLink,
    /// The folder was not shared before
    fresh: bool,
    profile_version: Version,
    /// Version of the shared document the subtree was read from
    document_version: Version,
    old_keys: KeyPair,
    new_keys: KeyPair,
    secret: Secret,
    members: BTreeMap<String, MemberShare>,
    permissions: BTreeMap<String, PermissionType>,
    chunks: Vec<DhtKey>,
    subtree: IndexTree,
    fingerprint: Vec<(FileId, String, Option<ContentHash>)>,
    grantee: String,
    invitation: Invitation,
}

#[derive(Default)]
struct ShareState {
    plan: Option<SharePlan>,
    published: Option<Version>,
    previous_document: Option<SharedFolderDocument>,
    invited: bool,
}

type State = Arc<Mutex<ShareState>>;

fn plan(state: &State) -> Result<SharePlan, SyncError> {
    state
        .lock()
        .plan
        .clone()
        .ok_or_else(|| SyncError::NotFound("share plan".into()))
}

/// Shape of a subtree, used to notice concurrent edits
fn fingerprint(tree: &IndexTree, id: &FileId) -> Vec<(FileId, String, Option<ContentHash>)> {
    tree.descendants(id)
        .into_iter()
        .skip(1)
        .filter_map(|child| tree.get(&child))
        .map(|node| {
            (
                node.id(),
                node.name().to_string(),
                node.as_file().map(|file| file.content_hash),
            )
        })
        .collect()
}

/// Grant `grantee` `permission` on the folder at `path`
pub fn share(
    ctx: &SyncContext,
    path: impl Into<PathBuf>,
    grantee: impl Into<String>,
    permission: PermissionType,
) -> Process {
    let path = path.into();
    let grantee = grantee.into();
    let state = State::default();
    let fresh = state.clone();

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ValidateShare {
            ctx: ctx.clone(),
            path: path.clone(),
            grantee: grantee.clone(),
            permission,
            state: state.clone(),
        }),
        ProcessComponent::step(RotateKeys {
            ctx: ctx.clone(),
            state: state.clone(),
        }),
        ProcessComponent::step(PublishDocument {
            ctx: ctx.clone(),
            state: state.clone(),
        }),
        ProcessComponent::decision(
            move || fresh.lock().plan.as_ref().is_some_and(|plan| plan.fresh),
            ProcessComponent::step(CommitPlaceholder {
                ctx: ctx.clone(),
                state: state.clone(),
            }),
            ProcessComponent::nothing(),
        ),
        ProcessComponent::step(PostInvitation {
            ctx: ctx.clone(),
            state,
        }),
    ]);
    Process::new(
        format!("share {} with {}", path.display(), grantee),
        root,
    )
    .with_timeout(ctx.config().process_timeout())
}

struct ValidateShare {
    ctx: SyncContext,
    path: PathBuf,
    grantee: String,
    permission: PermissionType,
    state: State,
}

#[async_trait]
impl Step for ValidateShare {
    fn name(&self) -> &str {
        "validate share"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let store = self.ctx.store();
        let user_id = self.ctx.user_id().to_string();
        if self.grantee == user_id {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} already owns /{}",
                user_id,
                self.path.display()
            )));
        }
        let profile = store.read().await?;
        let tree = profile.tree();

        let folder = profile.resolve(&self.path)?;
        let node = tree.node(&folder)?;
        if !node.is_folder() || node.parent().is_none() {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} cannot be shared",
                describe(tree, &folder)
            )));
        }
        require_write(tree, &folder, &user_id)?;
        if tree.contains_mount_below(&folder) {
            return Err(SyncError::IllegalFileLocation(format!(
                "{} contains a shared folder",
                describe(tree, &folder)
            )));
        }

        let (fresh, link, document_version, old_keys, secret) = match tree.mount_root_of(&folder) {
            None => (
                true,
                SharedLink {
                    owner: user_id.clone(),
                    folder,
                },
                Version::ZERO,
                keys_of(tree, &folder, &user_id)?,
                Secret::generate(),
            ),
            Some(mount) if mount == folder => {
                let link = node
                    .shared_link()
                    .cloned()
                    .ok_or_else(|| SyncError::NotFound(describe(tree, &folder)))?;
                if link.owner != user_id {
                    return Err(SyncError::PermissionDenied(format!(
                        "only {} can share {}",
                        link.owner,
                        describe(tree, &folder)
                    )));
                }
                let state = profile.mount(&folder).ok_or_else(|| {
                    SyncError::NotFound(format!("shared folder {}", describe(tree, &folder)))
                })?;
                (
                    false,
                    link,
                    state.version,
                    keys_of(tree, &folder, &user_id)?,
                    state.secret.clone(),
                )
            }
            Some(_) => {
                return Err(SyncError::IllegalFileLocation(format!(
                    "{} lies inside a shared folder",
                    describe(tree, &folder)
                )));
            }
        };

        let mut permissions = node.explicit_permissions().clone();
        permissions.insert(user_id.clone(), PermissionType::Write);
        permissions.insert(self.grantee.clone(), self.permission);

        let new_keys = KeyPair::generate();
        let mut members = BTreeMap::new();
        for (member, permission) in &permissions {
            let public = if *member == user_id {
                profile.identity_public()
            } else {
                store.lookup_public_key(member).await?
            };
            members.insert(
                member.clone(),
                MemberShare::new(*permission, &secret, &new_keys, &public)?,
            );
        }

        let mut subtree = tree.subtree(&folder, &user_id)?;
        subtree.set_permissions(&folder, permissions.clone())?;
        subtree.set_link(&folder, Some(link.clone()))?;
        let files = tree.files_in(&folder);
        let chunks = content::chunk_keys(files.iter().filter_map(|node| node.as_file()));

        self.state.lock().plan = Some(SharePlan {
            folder,
            link,
            fresh,
            profile_version: profile.version(),
            document_version,
            old_keys,
            new_keys,
            secret,
            members,
            permissions,
            chunks,
            subtree,
            fingerprint: fingerprint(tree, &folder),
            grantee: self.grantee.clone(),
            invitation: Invitation {
                owner: user_id,
                folder,
                name: node.name().to_string(),
            },
        });
        Ok(())
    }
}

/// Hand every chunk below the folder to the fresh protection keys
struct RotateKeys {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for RotateKeys {
    fn name(&self) -> &str {
        "rotate protection keys"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        content::reprotect(
            self.ctx.dht().as_ref(),
            self.ctx.retry(),
            &plan.chunks,
            &plan.old_keys,
            &plan.new_keys,
        )
        .await
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        content::reprotect(
            self.ctx.dht().as_ref(),
            self.ctx.retry(),
            &plan.chunks,
            &plan.new_keys,
            &plan.old_keys,
        )
        .await
    }
}

/// Write the shared folder document under the new keys
struct PublishDocument {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for PublishDocument {
    fn name(&self) -> &str {
        "publish shared folder document"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let store = self.ctx.store();
        let document = SharedFolderDocument::seal(
            &plan.link,
            plan.new_keys.public(),
            plan.members.clone(),
            &plan.secret,
            &plan.subtree,
        )?;

        let version = if plan.fresh {
            store.put_shared(Version::ZERO, &document, &plan.new_keys).await?
        } else {
            let (previous, base) = store
                .read_shared(&plan.link)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("shared folder {:?}", plan.folder)))?;
            if base != plan.document_version {
                // a member wrote since the subtree was read
                return Err(SyncError::VersionConflict {
                    key: plan.link.document_key(),
                    expected: plan.document_version,
                    current: base,
                });
            }
            let rebound = store
                .protect_shared(&plan.link, base, &plan.old_keys, &plan.new_keys)
                .await?;
            self.state.lock().previous_document = Some(previous);
            match store.put_shared(rebound, &document, &plan.new_keys).await {
                Ok(version) => version,
                Err(err) => {
                    store
                        .protect_shared(&plan.link, rebound, &plan.new_keys, &plan.old_keys)
                        .await?;
                    return Err(err);
                }
            }
        };
        tracing::info!(
            "published shared folder {:?} for {} member(s)",
            plan.folder,
            plan.members.len()
        );
        self.state.lock().published = Some(version);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let store = self.ctx.store();
        let Some((_, version)) = store.read_shared(&plan.link).await? else {
            return Ok(());
        };
        let previous = self.state.lock().previous_document.take();
        match previous {
            None => store.remove_shared(&plan.link, version, &plan.new_keys).await,
            Some(previous) => {
                let rebound = store
                    .protect_shared(&plan.link, version, &plan.new_keys, &plan.old_keys)
                    .await?;
                store.put_shared(rebound, &previous, &plan.old_keys).await?;
                Ok(())
            }
        }
    }
}

/// Cut the folder's subtree back to a placeholder in the owner's profile
struct CommitPlaceholder {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for CommitPlaceholder {
    fn name(&self) -> &str {
        "commit shared placeholder"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let key = DhtKey::profile(self.ctx.user_id());
        self.ctx
            .store()
            .commit(Document::Own, |profile| {
                if fingerprint(profile.tree(), &plan.folder) != plan.fingerprint {
                    // the published subtree is stale
                    return Err(SyncError::VersionConflict {
                        key,
                        expected: plan.profile_version,
                        current: profile.version(),
                    });
                }
                let tree = profile.tree_mut();
                tree.set_permissions(&plan.folder, plan.permissions.clone())?;
                tree.set_link(&plan.folder, Some(plan.link.clone()))?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        self.ctx
            .store()
            .commit(Document::Own, |profile| {
                if profile.tree().contains(&plan.folder) {
                    let tree = profile.tree_mut();
                    tree.set_link(&plan.folder, None)?;
                    tree.set_permissions(&plan.folder, BTreeMap::new())?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

struct PostInvitation {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for PostInvitation {
    fn name(&self) -> &str {
        "post invitation"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        let invited = self
            .ctx
            .store()
            .post_invitation(&plan.grantee, plan.invitation.clone())
            .await?;
        self.state.lock().invited = invited;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let plan = plan(&self.state)?;
        if !self.state.lock().invited {
            return Ok(());
        }
        self.ctx
            .store()
            .withdraw_invitation(&plan.grantee, &plan.invitation)
            .await
    }
}

#[derive(Default)]
struct AcceptState {
    /// Invitations to mount
    pending: Vec<Invitation>,
    /// Everything to clear from the inbox, mounted or not
    handled: Vec<Invitation>,
    mounted: Vec<FileId>,
}

type AcceptShared = Arc<Mutex<AcceptState>>;

/// Mount every readable invitation at the root of the tree
pub fn accept_shares(ctx: &SyncContext) -> Process {
    let state = AcceptShared::default();
    let outcome = OutcomeCell::default();
    let any = state.clone();

    let root = ProcessComponent::sequence([
        ProcessComponent::step(ReadInbox {
            ctx: ctx.clone(),
            state: state.clone(),
            outcome: outcome.clone(),
        }),
        ProcessComponent::decision(
            move || !any.lock().handled.is_empty(),
            ProcessComponent::sequence([
                ProcessComponent::step(CommitMounts {
                    ctx: ctx.clone(),
                    state: state.clone(),
                }),
                ProcessComponent::step(ClearInbox {
                    ctx: ctx.clone(),
                    state,
                }),
            ]),
            ProcessComponent::nothing(),
        ),
    ]);
    Process::new("accept shares", root)
        .with_outcome(outcome)
        .with_timeout(ctx.config().process_timeout())
}

/// A root-level name for a mount, avoiding existing children
fn mount_name(tree: &IndexTree, invitation: &Invitation) -> String {
    let root = tree.root_id();
    if tree.child(&root, &invitation.name).is_none() {
        return invitation.name.clone();
    }
    let base = format!("{} ({})", invitation.name, invitation.owner);
    let mut candidate = base.clone();
    let mut n = 2;
    while tree.child(&root, &candidate).is_some() {
        candidate = format!("{} {}", base, n);
        n += 1;
    }
    candidate
}

struct ReadInbox {
    ctx: SyncContext,
    state: AcceptShared,
    outcome: OutcomeCell,
}

#[async_trait]
impl Step for ReadInbox {
    fn name(&self) -> &str {
        "read inbox"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let store = self.ctx.store();
        let inbox = store.read_inbox().await?;
        if inbox.invitations.is_empty() {
            self.outcome.set(Outcome::NoOp);
            return Ok(());
        }
        let profile = store.read().await?;

        let mut pending = Vec::new();
        for invitation in &inbox.invitations {
            if profile.tree().contains(&invitation.folder) {
                continue;
            }
            let readable = match store.read_shared(&invitation.link()).await? {
                Some((document, _)) => document.members.contains_key(self.ctx.user_id()),
                None => false,
            };
            if readable {
                pending.push(invitation.clone());
            } else {
                tracing::warn!(
                    "dropping stale invitation from {} for {:?}",
                    invitation.owner,
                    invitation.folder
                );
            }
        }

        if pending.is_empty() {
            self.outcome.set(Outcome::NoOp);
        }
        let mut state = self.state.lock();
        state.pending = pending;
        state.handled = inbox.invitations;
        Ok(())
    }
}

struct CommitMounts {
    ctx: SyncContext,
    state: AcceptShared,
}

#[async_trait]
impl Step for CommitMounts {
    fn name(&self) -> &str {
        "commit mounts"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let pending = self.state.lock().pending.clone();
        if pending.is_empty() {
            return Ok(());
        }
        let mut mounted = Vec::new();
        self.ctx
            .store()
            .commit(Document::Own, |profile| {
                mounted.clear();
                let root = profile.tree().root_id();
                for invitation in &pending {
                    if profile.tree().contains(&invitation.folder) {
                        continue;
                    }
                    let name = mount_name(profile.tree(), invitation);
                    let tree = profile.tree_mut();
                    tree.insert(&root, Index::folder_with_id(invitation.folder, name))?;
                    tree.set_link(&invitation.folder, Some(invitation.link()))?;
                    mounted.push(invitation.folder);
                }
                Ok(())
            })
            .await?;
        tracing::info!("mounted {} shared folder(s)", mounted.len());
        self.state.lock().mounted = mounted;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let mounted = self.state.lock().mounted.clone();
        if mounted.is_empty() {
            return Ok(());
        }
        self.ctx
            .store()
            .commit(Document::Own, |profile| {
                for folder in &mounted {
                    if profile.tree().contains(folder) {
                        profile.tree_mut().detach(folder)?;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

struct ClearInbox {
    ctx: SyncContext,
    state: AcceptShared,
}

#[async_trait]
impl Step for ClearInbox {
    fn name(&self) -> &str {
        "clear inbox"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let handled = self.state.lock().handled.clone();
        self.ctx.store().clear_invitations(&handled).await
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let handled = self.state.lock().handled.clone();
        let own = self.ctx.user_id().to_string();
        for invitation in handled {
            self.ctx.store().post_invitation(&own, invitation).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_mount_name_avoids_collisions() {
        let mut tree = IndexTree::new("bob", None);
        let root = tree.root_id();
        let invitation = Invitation {
            owner: "alice".into(),
            folder: SecretKey::generate().public(),
            name: "photos".into(),
        };
        assert_eq!(mount_name(&tree, &invitation), "photos");

        tree.insert(&root, Index::folder("photos")).unwrap();
        assert_eq!(mount_name(&tree, &invitation), "photos (alice)");

        tree.insert(&root, Index::folder("photos (alice)")).unwrap();
        assert_eq!(mount_name(&tree, &invitation), "photos (alice) 2");
    }
}
