//! File event queue between a filesystem watcher and the sync worker
//!
//! The watcher itself lives outside this crate. It hands absolute paths to
//! an [`EventDispatcher`]; a worker drains the matching [`EventReceiver`]
//! and turns each event into a process (see
//! [`Session::spawn_event_worker`](crate::session::Session::spawn_event_worker)).

use std::path::{Path, PathBuf};

use anyhow::Result;

/// A change observed under the local sync root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A file or folder appeared
    Created(PathBuf),
    /// A file's content changed
    Modified(PathBuf),
    /// A file or folder was moved or renamed
    Moved { from: PathBuf, to: PathBuf },
    /// A file or folder was removed
    Deleted(PathBuf),
}

impl FileEvent {
    /// The path the event leaves behind (the destination of a move)
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) | FileEvent::Deleted(path) => {
                path
            }
            FileEvent::Moved { to, .. } => to,
        }
    }
}

/// Event dispatcher that can be cloned and handed to the watcher
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: flume::Sender<FileEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher and the receiver for the worker task
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, EventReceiver { rx })
    }

    /// Queue an event; fails only once the receiver is gone
    pub fn dispatch(&self, event: FileEvent) -> Result<()> {
        tracing::debug!("queueing file event {:?}", event);
        self.tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("file event receiver has been dropped"))
    }

    pub fn created(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.dispatch(FileEvent::Created(path.into()))
    }

    pub fn modified(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.dispatch(FileEvent::Modified(path.into()))
    }

    pub fn moved(&self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Result<()> {
        self.dispatch(FileEvent::Moved {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn deleted(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.dispatch(FileEvent::Deleted(path.into()))
    }
}

/// Receiving end, owned by one worker
#[derive(Debug)]
pub struct EventReceiver {
    rx: flume::Receiver<FileEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    ///
    /// Returns None once every dispatcher has been dropped.
    pub async fn recv(&self) -> Option<FileEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Returns None if nothing is queued or every dispatcher is gone.
    pub fn try_recv(&self) -> Option<FileEvent> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (dispatcher, receiver) = EventDispatcher::new();
        dispatcher.created("/sync/a.txt").unwrap();
        dispatcher.moved("/sync/a.txt", "/sync/b.txt").unwrap();
        dispatcher.deleted("/sync/b.txt").unwrap();
        assert_eq!(receiver.len(), 3);

        assert_eq!(
            receiver.recv().await,
            Some(FileEvent::Created("/sync/a.txt".into()))
        );
        let moved = receiver.recv().await.unwrap();
        assert_eq!(moved.path(), Path::new("/sync/b.txt"));
        assert_eq!(
            receiver.try_recv(),
            Some(FileEvent::Deleted("/sync/b.txt".into()))
        );
        assert!(receiver.is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (dispatcher, receiver) = EventDispatcher::new();
        drop(dispatcher);
        assert_eq!(receiver.recv().await, None);

        let (dispatcher, receiver) = EventDispatcher::new();
        drop(receiver);
        assert!(dispatcher.modified("/sync/a.txt").is_err());
    }
}
