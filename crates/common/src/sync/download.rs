//! Download of single files and reconciliation of the whole local root

use std::cmp::Reverse;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::content;
use super::SyncContext;
use crate::crypto::content_hash;
use crate::error::SyncError;
use crate::index::{FileId, FileIndex, IndexTree};
use crate::process::{Outcome, OutcomeCell, Process, ProcessComponent, Step};

/// Suffix of the temp files a download writes before renaming into place
const PART_SUFFIX: &str = ".drift-part";

enum Backup {
    Absent,
    Previous(Vec<u8>),
}

#[derive(Default)]
struct DownloadState {
    noop: bool,
    file: Option<FileIndex>,
    target: PathBuf,
    data: Option<Vec<u8>>,
    backup: Option<Backup>,
}

type State = Arc<Mutex<DownloadState>>;

/// Bring the local copy of file `id` in line with the tree
///
/// A local file with matching content is left alone, modification time
/// included, and the process reports `Outcome::NoOp`. Differing local
/// content is overwritten.
pub fn download(ctx: &SyncContext, id: FileId) -> Process {
    let outcome = OutcomeCell::default();
    let root = download_component(ctx, id, outcome.clone());
    Process::new(format!("download {}", id.to_short_hex()), root)
        .with_outcome(outcome)
        .with_timeout(ctx.config().process_timeout())
}

fn download_component(ctx: &SyncContext, id: FileId, outcome: OutcomeCell) -> ProcessComponent {
    let state = State::default();
    let proceed = state.clone();
    ProcessComponent::sequence([
        ProcessComponent::step(ResolveDownload {
            ctx: ctx.clone(),
            id,
            state: state.clone(),
            outcome,
        }),
        ProcessComponent::decision(
            move || !proceed.lock().noop,
            ProcessComponent::sequence([
                ProcessComponent::step(FetchContent {
                    ctx: ctx.clone(),
                    state: state.clone(),
                }),
                ProcessComponent::step(WriteLocal { state }),
            ]),
            ProcessComponent::nothing(),
        ),
    ])
}

/// Mirror the tree into the local root
///
/// Local entries the tree no longer has are removed first, so a remote
/// move or delete is followed on disk. Then missing folders are created
/// and missing or differing files fetched.
pub async fn synchronize(ctx: &SyncContext) -> Result<Process, SyncError> {
    let profile = ctx.store().read().await?;
    let tree = profile.tree();

    let mut components = Vec::new();
    for (local, folder) in stale_local_entries(ctx, tree).await? {
        components.push(ProcessComponent::step(RemoveLocal {
            path: local,
            folder,
            backup: None,
            removed: false,
        }));
    }
    for id in tree.descendants(&tree.root_id()).into_iter().skip(1) {
        let node = tree.node(&id)?;
        let Some(path) = tree.path_of(&id) else {
            continue;
        };
        let local = ctx.local_path(&path);
        if node.is_folder() {
            if !is_dir(&local).await {
                components.push(ProcessComponent::step(CreateDir {
                    path: local,
                    created: false,
                }));
            }
        } else if let Some(file) = node.as_file() {
            if !matches_local(&local, file).await? {
                // each file decides its own no-op; the process outcome
                // reflects the plan as a whole
                components.push(download_component(ctx, id, OutcomeCell::default()));
            }
        }
    }

    let outcome = OutcomeCell::default();
    if components.is_empty() {
        outcome.set(Outcome::NoOp);
    }
    tracing::info!(
        "synchronize {}: {} action(s) planned",
        ctx.root().display(),
        components.len()
    );
    Ok(Process::new("synchronize", ProcessComponent::sequence(components))
        .with_outcome(outcome)
        .with_timeout(ctx.config().process_timeout()))
}

/// Local entries under the root with no node in `tree`, children first
async fn stale_local_entries(
    ctx: &SyncContext,
    tree: &IndexTree,
) -> Result<Vec<(PathBuf, bool)>, SyncError> {
    let mut stale = Vec::new();
    let mut pending = vec![ctx.root().to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let local = entry.path();
            if is_part_file(&local) {
                continue;
            }
            let folder = entry.file_type().await?.is_dir();
            if folder {
                pending.push(local.clone());
            }
            let path = ctx.tree_path(&local)?;
            if tree.resolve(&path).is_none() {
                stale.push((local, folder));
            }
        }
    }
    stale.sort_by_key(|(local, _)| Reverse(local.components().count()));
    Ok(stale)
}

fn is_part_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(PART_SUFFIX))
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Whether `local` already holds exactly `file`'s content
async fn matches_local(local: &Path, file: &FileIndex) -> Result<bool, SyncError> {
    match tokio::fs::read(local).await {
        Ok(data) => Ok(content_hash(&data) == file.content_hash),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Write through a sibling temp file and rename it into place
async fn write_atomic(target: &Path, data: &[u8]) -> Result<(), SyncError> {
    let dir = target
        .parent()
        .ok_or_else(|| SyncError::IllegalFileLocation(target.display().to_string()))?;
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SyncError::IllegalFileLocation(target.display().to_string()))?;
    tokio::fs::create_dir_all(dir).await?;

    let part = dir.join(format!(".{}{}", name, PART_SUFFIX));
    tokio::fs::write(&part, data).await?;
    if let Err(err) = tokio::fs::rename(&part, target).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(err.into());
    }
    Ok(())
}

struct ResolveDownload {
    ctx: SyncContext,
    id: FileId,
    state: State,
    outcome: OutcomeCell,
}

#[async_trait]
impl Step for ResolveDownload {
    fn name(&self) -> &str {
        "resolve download"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let profile = self.ctx.store().read().await?;
        let tree = profile.tree();
        let node = tree
            .get(&self.id)
            .ok_or_else(|| SyncError::NotFound(format!("file {:?}", self.id)))?;
        let file = node.as_file().cloned().ok_or_else(|| {
            SyncError::IllegalFileLocation(format!("{:?} is a folder", self.id))
        })?;
        let path = tree
            .path_of(&self.id)
            .ok_or_else(|| SyncError::NotFound(format!("file {:?}", self.id)))?;
        let target = self.ctx.local_path(&path);

        let noop = matches_local(&target, &file).await?;
        if noop {
            tracing::info!("{} is already up to date", target.display());
            self.outcome.set(Outcome::NoOp);
        }
        let mut state = self.state.lock();
        state.noop = noop;
        state.file = Some(file);
        state.target = target;
        Ok(())
    }
}

struct FetchContent {
    ctx: SyncContext,
    state: State,
}

#[async_trait]
impl Step for FetchContent {
    fn name(&self) -> &str {
        "fetch content"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let file = self
            .state
            .lock()
            .file
            .clone()
            .ok_or_else(|| SyncError::NotFound("download source".into()))?;
        let data = content::fetch(self.ctx.dht().as_ref(), self.ctx.retry(), &file).await?;
        self.state.lock().data = Some(data);
        Ok(())
    }
}

/// Replace the local file, keeping what was there for rollback
struct WriteLocal {
    state: State,
}

#[async_trait]
impl Step for WriteLocal {
    fn name(&self) -> &str {
        "write local file"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let (target, data) = {
            let mut state = self.state.lock();
            (state.target.clone(), state.data.take())
        };
        let data = data.ok_or_else(|| SyncError::NotFound("downloaded content".into()))?;

        let backup = match tokio::fs::read(&target).await {
            Ok(previous) => Backup::Previous(previous),
            Err(err) if err.kind() == ErrorKind::NotFound => Backup::Absent,
            Err(err) => return Err(err.into()),
        };
        write_atomic(&target, &data).await?;
        tracing::debug!("wrote {} ({} bytes)", target.display(), data.len());
        self.state.lock().backup = Some(backup);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        let (target, backup) = {
            let mut state = self.state.lock();
            (state.target.clone(), state.backup.take())
        };
        match backup {
            Some(Backup::Previous(previous)) => write_atomic(&target, &previous).await,
            Some(Backup::Absent) => {
                tokio::fs::remove_file(&target).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Remove a local entry the tree dropped, keeping file bytes for rollback
///
/// Folders are removed only once empty; their children come first in the
/// plan.
struct RemoveLocal {
    path: PathBuf,
    folder: bool,
    backup: Option<Vec<u8>>,
    removed: bool,
}

#[async_trait]
impl Step for RemoveLocal {
    fn name(&self) -> &str {
        "remove stale local entry"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        let result = if self.folder {
            tokio::fs::remove_dir(&self.path).await
        } else {
            match tokio::fs::read(&self.path).await {
                Ok(data) => {
                    self.backup = Some(data);
                    tokio::fs::remove_file(&self.path).await
                }
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(()) => {
                tracing::debug!("removed stale {}", self.path.display());
                self.removed = true;
                Ok(())
            }
            // gone already
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        if !self.removed {
            return Ok(());
        }
        if self.folder {
            tokio::fs::create_dir_all(&self.path).await?;
        } else if let Some(data) = &self.backup {
            write_atomic(&self.path, data).await?;
        }
        Ok(())
    }
}

struct CreateDir {
    path: PathBuf,
    created: bool,
}

#[async_trait]
impl Step for CreateDir {
    fn name(&self) -> &str {
        "create local folder"
    }

    async fn execute(&mut self) -> Result<(), SyncError> {
        if is_dir(&self.path).await {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.path).await?;
        self.created = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SyncError> {
        if self.created {
            tokio::fs::remove_dir(&self.path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("file.txt");

        write_atomic(&target, b"first").await.unwrap();
        write_atomic(&target, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"second");
        let mut entries = tokio::fs::read_dir(target.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("file.txt")]);
    }

    #[tokio::test]
    async fn test_remove_local_restores_on_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("old");
        let file = folder.join("a.bin");
        write_atomic(&file, b"kept").await.unwrap();

        let mut remove_file = RemoveLocal {
            path: file.clone(),
            folder: false,
            backup: None,
            removed: false,
        };
        let mut remove_folder = RemoveLocal {
            path: folder.clone(),
            folder: true,
            backup: None,
            removed: false,
        };
        remove_file.execute().await.unwrap();
        remove_folder.execute().await.unwrap();
        assert!(!folder.exists());

        remove_folder.rollback().await.unwrap();
        remove_file.rollback().await.unwrap();
        assert_eq!(tokio::fs::read(&file).await.unwrap(), b"kept");

        // a vanished entry is not an error, and nothing comes back
        let mut vanished = RemoveLocal {
            path: dir.path().join("never"),
            folder: false,
            backup: None,
            removed: false,
        };
        vanished.execute().await.unwrap();
        vanished.rollback().await.unwrap();
        assert!(!dir.path().join("never").exists());
    }

    #[test]
    fn test_part_files_are_recognised() {
        assert!(is_part_file(Path::new("/root/.a.bin.drift-part")));
        assert!(!is_part_file(Path::new("/root/a.bin")));
    }

    #[tokio::test]
    async fn test_create_dir_rolls_back_only_what_it_made() {
        let dir = tempfile::tempdir().unwrap();
        let mut existing = CreateDir {
            path: dir.path().to_path_buf(),
            created: false,
        };
        existing.execute().await.unwrap();
        existing.rollback().await.unwrap();
        assert!(dir.path().exists());

        let mut fresh = CreateDir {
            path: dir.path().join("new"),
            created: false,
        };
        fresh.execute().await.unwrap();
        assert!(dir.path().join("new").is_dir());
        fresh.rollback().await.unwrap();
        assert!(!dir.path().join("new").exists());
    }
}
