//! # trib-lock
//!
//! In-process coordination of concurrent access to a shared filesystem tree.
//!
//! Processes that hammer one tree from many threads (artifact caches, content
//! stores) need three things ordinary file locks don't give them:
//!
//! - **Hierarchical locking**: write-locking a directory protects everything
//!   beneath it, and lock counts roll up the ancestor chain so a directory's
//!   count reflects the operations nested under it.
//! - **Reentrant, owner-aware locks**: one logical operation can nest
//!   acquisitions on the same paths without deadlocking itself.
//! - **Joinable streams**: a reader opened while a write is in progress joins
//!   the live byte stream instead of blocking or failing, and observes
//!   end-of-data only once the writer completes.
//!
//! The public entry point is [`FileLockManager`]. All state is process-local
//! and memory-only; entries are created lazily on first lock/open and evicted
//! eagerly once the last handle releases.
//!
//! ```ignore
//! use trib_lock::{FileLockManager, LockLevel, Wait};
//!
//! let mgr = FileLockManager::new();
//! assert!(mgr.lock("/cache/objects", Wait::Forever, LockLevel::Write));
//! let mut out = mgr
//!     .open_output_stream("/cache/objects/ab/blob.bin", Wait::default_bound())?
//!     .expect("no contention");
//! // ... write through `out`; readers may join concurrently ...
//! out.close()?;
//! mgr.unlock("/cache/objects");
//! ```

mod joinable;
mod manager;
mod owner;
mod tree;

pub use manager::{FileLockManager, JoinableReadHandle, JoinableWriteHandle};
pub use owner::{OwnerContext, OwnerScope};
pub use tree::{EntrySnapshot, FileTree};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by stream operations.
///
/// Contention and timeouts are *not* errors; they are reported as plain
/// negative values (`false` / `Ok(None)`) by the operations that can
/// encounter them.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock conflict on {path}: held by {owner}")]
    Conflict { path: PathBuf, owner: String },

    #[error("a writer is already attached to {path}")]
    WriterActive { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Exclusivity class of a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    /// Shared: any number of owners may hold `Read` concurrently.
    Read,
    /// Exclusive: one owner; excludes all other acquisition until released.
    Write,
}

/// Bound on a blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Attempt acquisition exactly once; never block.
    None,
    /// Block up to the given bound; expiry is a normal negative outcome.
    For(Duration),
    /// Block until the lock is available.
    Forever,
}

impl Wait {
    /// Bounded wait of `ms` milliseconds.
    pub fn millis(ms: u64) -> Self {
        Wait::For(Duration::from_millis(ms))
    }

    /// The configured default bound (`lock.default_wait_ms`).
    pub fn default_bound() -> Self {
        Wait::For(trib_config::config().lock.default_wait())
    }
}
