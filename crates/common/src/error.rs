use std::time::Duration;

use crate::codec::CodecError;
use crate::crypto::{KeyError, SecretError, SecretShareError};
use crate::dht::{DhtError, DhtKey, Version};
use crate::index::TreeError;

/// Failure reported by a profile store call, a process step, or a whole process
///
/// Cloneable so one terminal failure can be handed to every listener and
/// every waiter on a process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A conditional write lost the race; re-read and re-apply
    #[error("version conflict at {key}: expected {expected}, current {current}")]
    VersionConflict {
        key: DhtKey,
        expected: Version,
        current: Version,
    },
    /// The acting user lacks WRITE where the operation needs it
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A local validation rejected the target location; nothing was written
    #[error("illegal file location: {0}")]
    IllegalFileLocation(String),
    /// The DHT or local disk could not be reached
    #[error("io failure: {0}")]
    IoFailure(String),
    /// The user's root record could not be fetched or opened
    #[error("profile unavailable: {0}")]
    ProfileUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("process cancelled")]
    Cancelled,
    #[error("process timed out after {0:?}")]
    Timeout(Duration),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Discriminant of [`SyncError`], for matching without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    VersionConflict,
    PermissionDenied,
    IllegalFileLocation,
    IoFailure,
    ProfileUnavailable,
    NotFound,
    AlreadyExists,
    Cancelled,
    Timeout,
    Crypto,
    Codec,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::VersionConflict { .. } => ErrorKind::VersionConflict,
            SyncError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SyncError::IllegalFileLocation(_) => ErrorKind::IllegalFileLocation,
            SyncError::IoFailure(_) => ErrorKind::IoFailure,
            SyncError::ProfileUnavailable(_) => ErrorKind::ProfileUnavailable,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Crypto(_) => ErrorKind::Crypto,
            SyncError::Codec(_) => ErrorKind::Codec,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::VersionConflict
    }
}

impl From<DhtError> for SyncError {
    fn from(err: DhtError) -> Self {
        match err {
            DhtError::Conflict {
                key,
                expected,
                current,
            } => SyncError::VersionConflict {
                key,
                expected,
                current,
            },
            DhtError::ProtectionDenied(key) => {
                SyncError::PermissionDenied(format!("dht entry {} is protected", key))
            }
            DhtError::NotFound(key) => SyncError::NotFound(format!("dht entry {}", key)),
            DhtError::Unavailable(reason) => SyncError::IoFailure(reason),
        }
    }
}

impl From<TreeError> for SyncError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound(what) => SyncError::NotFound(what),
            TreeError::NotAFolder(what) => {
                SyncError::IllegalFileLocation(format!("{} is not a folder", what))
            }
            TreeError::AlreadyExists(what) => SyncError::AlreadyExists(what),
            TreeError::MoveIntoSelf { from, to } => SyncError::IllegalFileLocation(format!(
                "cannot move '{}' into its own subtree '{}'",
                from, to
            )),
            TreeError::RootImmutable => SyncError::IllegalFileLocation(err_root()),
            TreeError::Malformed(reason) => SyncError::Codec(reason),
        }
    }
}

fn err_root() -> String {
    "the root folder cannot be moved or removed".to_string()
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::IoFailure(err.to_string())
    }
}

impl From<CodecError> for SyncError {
    fn from(err: CodecError) -> Self {
        SyncError::Codec(err.to_string())
    }
}

impl From<SecretError> for SyncError {
    fn from(err: SecretError) -> Self {
        SyncError::Crypto(err.to_string())
    }
}

impl From<SecretShareError> for SyncError {
    fn from(err: SecretShareError) -> Self {
        SyncError::Crypto(err.to_string())
    }
}

impl From<KeyError> for SyncError {
    fn from(err: KeyError) -> Self {
        SyncError::Crypto(err.to_string())
    }
}
