/**
 * DAG-CBOR encoding of everything we
 *  put into the DHT.
 */
pub mod codec;
/**
 * Tunables for commits, retries and
 *  process timeouts, loadable from TOML.
 */
pub mod config;
/**
 * Cryptographic types and operations.
 *  - Public and Private key implementations
 *  - Symmetric secrets for documents and chunks
 *  - Key-to-key secret sharing
 */
pub mod crypto;
/**
 * The key-value store contract we sync over.
 * Versioned conditional writes, protection
 *  keys, and an in-memory implementation
 *  with fault injection.
 */
pub mod dht;
pub mod error;
/**
 * The index tree: files, folders and
 *  the permissions that flow down them.
 */
pub mod index;
/**
 * Reversible multi-step processes, their
 *  executor, handles and listeners.
 */
pub mod process;
/**
 * A user's profile and shared folder
 *  documents, resolved into one view and
 *  written back with optimistic concurrency.
 */
pub mod profile;
/**
 * Entry point for applications: a logged
 *  in user and the processes they can run.
 */
pub mod session;
/**
 * The concrete sync processes and the
 *  file event queue that drives them.
 */
pub mod sync;
/**
 * Multi-peer harness over a shared
 *  in-memory DHT, for integration tests.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::crypto::{KeyPair, PublicKey, SecretKey};
    pub use crate::dht::{DhtStore, MemoryDht, Version};
    pub use crate::error::{ErrorKind, SyncError};
    pub use crate::index::{FileId, IndexTree, PermissionType};
    pub use crate::process::{Outcome, Process, ProcessHandle, ProcessListener, ProcessState};
    pub use crate::profile::{UserCredentials, UserProfile};
    pub use crate::session::Session;
    pub use crate::sync::{EventDispatcher, FileEvent};
}
