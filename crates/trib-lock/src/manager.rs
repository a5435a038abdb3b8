//! The lock manager facade.
//!
//! [`FileLockManager`] composes the owner context, the file tree and the
//! joinable stream engine into the public locking API. Each manager owns its
//! own tree, so independent managers never share state.
//!
//! Acquisition discipline: at most one entry mutex is held at a time.
//! Ancestor bookkeeping locks entries one by one after the target grant, so
//! there is no lock-order deadlock between entries. All blocking goes through
//! a deadline computed once per call and re-checked around every condvar
//! wake-up; expiry is a normal negative outcome, never an error.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use trib_config::path::canonical_lock_path;

use crate::joinable::JoinableFile;
use crate::owner::OwnerContext;
use crate::tree::{EntryState, FileEntry, FileTree};
use crate::{LockError, LockLevel, Result, Wait};

/// Public entry point for path locking, stream opening and state queries.
pub struct FileLockManager {
    tree: Arc<FileTree>,
    buffer_capacity: usize,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(FileTree::new()),
            buffer_capacity: trib_config::config().stream.initial_buffer_capacity,
        }
    }

    /// The tree tracking this manager's live entries (diagnostic surface).
    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    /// Bring `path` to `level` for the calling owner context.
    ///
    /// Reentrant same-owner acquisition succeeds immediately. Cross-owner
    /// contention (on the path or on a write-locked tracked ancestor) blocks
    /// up to `wait`; expiry returns `false`. Never fails for contention.
    pub fn lock(&self, path: impl AsRef<Path>, wait: Wait, level: LockLevel) -> bool {
        self.lock_as(path.as_ref(), wait, level, OwnerContext::current())
    }

    /// Like [`lock`](Self::lock), attributing the acquisition to a labeled
    /// owner on the calling thread. The matching release must use the same
    /// label (see [`OwnerContext::establish`]).
    pub fn lock_labeled(
        &self,
        path: impl AsRef<Path>,
        wait: Wait,
        level: LockLevel,
        label: &str,
    ) -> bool {
        self.lock_as(path.as_ref(), wait, level, OwnerContext::labeled(label))
    }

    fn lock_as(&self, path: &Path, wait: Wait, level: LockLevel, owner: OwnerContext) -> bool {
        let Ok(path) = canonical_lock_path(path) else {
            tracing::warn!("lock target could not be resolved");
            return false;
        };
        let deadline = Deadline::new(wait);
        loop {
            match self.pass_ancestors(&path, &owner, deadline) {
                AncestorPass::Clear => {}
                AncestorPass::Waited => continue,
                AncestorPass::TimedOut => return false,
            }
            let entry = self.tree.get_or_create(&path);
            let mut st = entry.lock_state();
            if st.defunct {
                continue;
            }
            let compatible = match level {
                LockLevel::Write => st.write_compatible(&owner),
                LockLevel::Read => st.read_compatible(&owner),
            };
            if compatible {
                st.add_hold(&owner, level);
                drop(st);
                self.rollup_ancestors(&path, &owner);
                tracing::debug!(path = %path.display(), owner = %owner, ?level, "lock acquired");
                return true;
            }
            if deadline.expired() {
                drop(st);
                self.tree.evict_if_idle(&entry);
                return false;
            }
            if !wait_for_change(&entry, st, deadline) {
                self.tree.evict_if_idle(&entry);
                return false;
            }
        }
    }

    /// Release one nested acquisition held by the calling owner context.
    ///
    /// Releases the lock and wakes waiters when the owner's last hold goes.
    /// Returns `false` (inert no-op) if the caller holds no direct lock on
    /// `path`.
    pub fn unlock(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonical_lock_path(path.as_ref()) else {
            return false;
        };
        let owner = OwnerContext::current();
        let Some(entry) = self.tree.get(&path) else {
            return false;
        };
        let released = {
            let mut st = entry.lock_state();
            !st.defunct && st.release_hold(&owner)
        };
        if !released {
            return false;
        }
        entry.notify_all();
        self.release_ancestor_rollups(&path, &owner);
        self.tree.evict_if_idle(&entry);
        tracing::debug!(path = %path.display(), owner = %owner, "lock released");
        true
    }

    /// Open a write stream on `path`, write-locking it and rolling the
    /// acquisition up every tracked ancestor.
    ///
    /// Contention resolution follows `wait`: an immediate no-wait owner
    /// mismatch is `Err(LockError::Conflict)`, a bounded wait that expires is
    /// `Ok(None)`, and `Wait::Forever` blocks. A second writer request from
    /// the same owner while its writer is attached is
    /// `Err(LockError::WriterActive)` — waiting on oneself cannot succeed.
    ///
    /// Filesystem failures are propagated unchanged; bookkeeping performed
    /// for the failed open is rolled back so the path is not left locked.
    pub fn open_output_stream(
        &self,
        path: impl AsRef<Path>,
        wait: Wait,
    ) -> Result<Option<JoinableWriteHandle>> {
        let path = resolve(path.as_ref())?;
        let owner = OwnerContext::current();
        let deadline = Deadline::new(wait);
        loop {
            match self.pass_ancestors(&path, &owner, deadline) {
                AncestorPass::Clear => {}
                AncestorPass::Waited => continue,
                AncestorPass::TimedOut => return self.write_denied(&path, wait),
            }
            let entry = self.tree.get_or_create(&path);
            let mut st = entry.lock_state();
            if st.defunct {
                continue;
            }

            if st.joinable.is_none() && st.write_compatible(&owner) {
                // Grant. The file is created and the stream attached under
                // the state lock so no reader can slip a stream in between.
                let file = match File::create(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        drop(st);
                        self.tree.evict_if_idle(&entry);
                        return Err(LockError::Io(e));
                    }
                };
                st.add_hold(&owner, LockLevel::Write);
                let joinable =
                    Arc::new(JoinableFile::for_write(path.clone(), self.buffer_capacity));
                st.joinable = Some(Arc::clone(&joinable));
                drop(st);
                let ancestors = self.rollup_ancestors(&path, &owner);
                tracing::debug!(path = %path.display(), owner = %owner, "output stream opened");
                return Ok(Some(JoinableWriteHandle {
                    file,
                    joinable: Arc::clone(&joinable),
                    ticket: Some(StreamTicket {
                        tree: Arc::clone(&self.tree),
                        entry,
                        joinable,
                        owner,
                        ancestors,
                        direct: true,
                    }),
                }));
            }

            if let Some(joinable) = &st.joinable {
                if joinable.writer_active() && st.holds.contains_key(&owner) {
                    drop(st);
                    return Err(LockError::WriterActive { path });
                }
            }

            if deadline.expired() {
                drop(st);
                self.tree.evict_if_idle(&entry);
                return self.write_denied(&path, wait);
            }
            if !wait_for_change(&entry, st, deadline) {
                self.tree.evict_if_idle(&entry);
                return self.write_denied(&path, wait);
            }
        }
    }

    /// Open a read stream on `path`.
    ///
    /// Never blocked by lock state: an in-progress write is joined (the
    /// reader receives bytes live and sees end-of-data when the writer
    /// completes); otherwise the on-disk content is served. Only filesystem
    /// failures are errors.
    pub fn open_input_stream(&self, path: impl AsRef<Path>) -> Result<JoinableReadHandle> {
        let path = resolve(path.as_ref())?;
        let owner = OwnerContext::current();
        loop {
            let entry = self.tree.get_or_create(&path);
            let mut st = entry.lock_state();
            if st.defunct {
                continue;
            }

            let joined;
            let direct;
            if let Some(existing) = st.joinable.clone() {
                joined = existing;
                direct = false;
            } else {
                let content = match fs::read(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        drop(st);
                        self.tree.evict_if_idle(&entry);
                        return Err(LockError::Io(e));
                    }
                };
                // A fresh stream on an unlocked entry takes the write hold
                // itself; on an entry locked by someone else it only adds an
                // attribution, leaving exclusivity untouched.
                direct = st.count() == 0;
                joined = Arc::new(JoinableFile::for_read(path.clone(), content));
                st.joinable = Some(Arc::clone(&joined));
            }
            joined.attach_reader();
            if direct {
                st.add_hold(&owner, LockLevel::Write);
            } else {
                st.add_rollup(&owner);
            }
            drop(st);
            let ancestors = self.rollup_ancestors(&path, &owner);
            tracing::debug!(path = %path.display(), owner = %owner, joined = !direct, "input stream opened");
            return Ok(JoinableReadHandle {
                joinable: Arc::clone(&joined),
                pos: 0,
                ticket: Some(StreamTicket {
                    tree: Arc::clone(&self.tree),
                    entry,
                    joinable: joined,
                    owner,
                    ancestors,
                    direct,
                }),
            });
        }
    }

    /// Block until no write lock is held on `path` or a tracked ancestor,
    /// up to `wait`. Returns `true` immediately if nothing is write-locked.
    pub fn wait_for_write_unlock(&self, path: impl AsRef<Path>, wait: Wait) -> bool {
        let Ok(path) = canonical_lock_path(path.as_ref()) else {
            return true;
        };
        let deadline = Deadline::new(wait);
        loop {
            let Some(blocker) = self.find_write_locked(&path) else {
                return true;
            };
            let st = blocker.lock_state();
            if st.defunct || st.level != Some(LockLevel::Write) {
                continue;
            }
            if deadline.expired() {
                return false;
            }
            if !wait_for_change(&blocker, st, deadline) {
                return self.find_write_locked(&path).is_none();
            }
        }
    }

    /// Is `path` write-locked, directly or through a tracked ancestor?
    /// A directory's write lock protects everything beneath it.
    pub fn is_write_locked(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonical_lock_path(path.as_ref()) else {
            return false;
        };
        self.find_write_locked(&path).is_some()
    }

    /// Is `path` itself read-locked?
    pub fn is_read_locked(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonical_lock_path(path.as_ref()) else {
            return false;
        };
        match self.tree.get(&path) {
            Some(entry) => entry.lock_state().level == Some(LockLevel::Read),
            None => false,
        }
    }

    /// Does the calling owner context hold a direct lock on `path`?
    pub fn is_locked_by_current_thread(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonical_lock_path(path.as_ref()) else {
            return false;
        };
        let owner = OwnerContext::current();
        match self.tree.get(&path) {
            Some(entry) => entry.lock_state().holds.contains_key(&owner),
            None => false,
        }
    }

    /// Aggregated reentrant count of `path`: direct holds plus attributions
    /// rolled up from descendant operations. 0 for untracked paths.
    pub fn context_lock_count(&self, path: impl AsRef<Path>) -> u32 {
        let Ok(path) = canonical_lock_path(path.as_ref()) else {
            return 0;
        };
        match self.tree.get(&path) {
            Some(entry) => entry.lock_state().count(),
            None => 0,
        }
    }

    fn find_write_locked(&self, path: &Path) -> Option<Arc<FileEntry>> {
        if let Some(entry) = self.tree.get(path) {
            if entry.lock_state().level == Some(LockLevel::Write) {
                return Some(entry);
            }
        }
        self.tree
            .tracked_ancestors(path)
            .into_iter()
            .find(|ancestor| ancestor.lock_state().level == Some(LockLevel::Write))
    }

    /// Check the tracked ancestors of `path` for a write lock another owner
    /// holds; wait on the nearest blocker if one is found.
    fn pass_ancestors(&self, path: &Path, owner: &OwnerContext, deadline: Deadline) -> AncestorPass {
        for ancestor in self.tree.tracked_ancestors(path) {
            let st = ancestor.lock_state();
            if st.defunct {
                return AncestorPass::Waited;
            }
            if st.level == Some(LockLevel::Write) && !st.write_compatible(owner) {
                if deadline.expired() {
                    return AncestorPass::TimedOut;
                }
                return if wait_for_change(&ancestor, st, deadline) {
                    AncestorPass::Waited
                } else {
                    AncestorPass::TimedOut
                };
            }
        }
        AncestorPass::Clear
    }

    /// Attribute one acquisition of `path` to every tracked ancestor.
    /// Returns the recorded ancestor set so the release decrements exactly
    /// what was incremented.
    fn rollup_ancestors(&self, path: &Path, owner: &OwnerContext) -> Vec<PathBuf> {
        let mut recorded = Vec::new();
        for ancestor in self.tree.tracked_ancestors(path) {
            let mut st = ancestor.lock_state();
            if st.defunct {
                continue;
            }
            st.add_rollup(owner);
            recorded.push(ancestor.path().to_path_buf());
        }
        recorded
    }

    fn release_ancestor_rollups(&self, path: &Path, owner: &OwnerContext) {
        for ancestor in self.tree.tracked_ancestors(path) {
            let released = { ancestor.lock_state().release_rollup(owner) };
            if released {
                ancestor.notify_all();
                self.tree.evict_if_idle(&ancestor);
            }
        }
    }

    fn write_denied(&self, path: &Path, wait: Wait) -> Result<Option<JoinableWriteHandle>> {
        match wait {
            Wait::None => Err(LockError::Conflict {
                path: path.to_path_buf(),
                owner: self.holder_display(path),
            }),
            _ => Ok(None),
        }
    }

    fn holder_display(&self, path: &Path) -> String {
        self.tree
            .get(path)
            .or_else(|| self.find_write_locked(path))
            .and_then(|entry| entry.lock_state().primary.as_ref().map(|o| o.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(path: &Path) -> Result<PathBuf> {
    canonical_lock_path(path).map_err(|e| LockError::Io(io::Error::other(e)))
}

enum AncestorPass {
    Clear,
    Waited,
    TimedOut,
}

/// Bound for one blocking call, computed once and re-checked per wake-up.
#[derive(Debug, Clone, Copy)]
enum Deadline {
    Immediate,
    At(Instant),
    Never,
}

impl Deadline {
    fn new(wait: Wait) -> Self {
        match wait {
            Wait::None => Deadline::Immediate,
            Wait::For(bound) => Deadline::At(Instant::now() + bound),
            Wait::Forever => Deadline::Never,
        }
    }

    fn expired(&self) -> bool {
        match self {
            Deadline::Immediate => true,
            Deadline::At(at) => Instant::now() >= *at,
            Deadline::Never => false,
        }
    }
}

/// Park on `entry` until it changes or the deadline passes. Returns `false`
/// when the caller should give up; `true` means re-check (a wake-up, spurious
/// or not — callers always re-validate state and deadline).
fn wait_for_change(entry: &FileEntry, guard: MutexGuard<'_, EntryState>, deadline: Deadline) -> bool {
    match deadline {
        Deadline::Immediate => {
            drop(guard);
            false
        }
        Deadline::Never => {
            drop(entry.wait(guard));
            true
        }
        Deadline::At(at) => {
            let now = Instant::now();
            if now >= at {
                drop(guard);
                return false;
            }
            drop(entry.wait_timeout(guard, at - now));
            true
        }
    }
}

/// Release record for one stream handle: the exact bookkeeping performed at
/// open, undone exactly once at close (explicit or drop).
struct StreamTicket {
    tree: Arc<FileTree>,
    entry: Arc<FileEntry>,
    joinable: Arc<JoinableFile>,
    owner: OwnerContext,
    ancestors: Vec<PathBuf>,
    direct: bool,
}

impl StreamTicket {
    fn release(self, is_writer: bool) {
        {
            let mut st = self.entry.lock_state();
            let detach = if is_writer {
                self.joinable.finish_write();
                self.joinable.idle()
            } else {
                self.joinable.detach_reader()
            };
            if detach {
                if let Some(current) = &st.joinable {
                    if Arc::ptr_eq(current, &self.joinable) {
                        st.joinable = None;
                    }
                }
            }
            if self.direct {
                st.release_hold(&self.owner);
            } else {
                st.release_rollup(&self.owner);
            }
        }
        self.entry.notify_all();
        for recorded in &self.ancestors {
            if let Some(ancestor) = self.tree.get(recorded) {
                let released = { ancestor.lock_state().release_rollup(&self.owner) };
                if released {
                    ancestor.notify_all();
                    self.tree.evict_if_idle(&ancestor);
                }
            }
        }
        self.tree.evict_if_idle(&self.entry);
        tracing::trace!(path = %self.joinable.path().display(), writer = is_writer, "stream handle released");
    }
}

/// Write side of a joinable stream.
///
/// Bytes go to the underlying file first and become visible to joined
/// readers only once written through. Closing (or dropping) the handle
/// signals end-of-data and releases the locks taken at open, exactly once.
pub struct JoinableWriteHandle {
    file: File,
    joinable: Arc<JoinableFile>,
    ticket: Option<StreamTicket>,
}

impl JoinableWriteHandle {
    /// Close the stream, reporting flush failures. End-of-data signaling and
    /// lock release happen regardless of the flush outcome.
    pub fn close(mut self) -> io::Result<()> {
        let flushed = self.file.flush();
        self.release();
        flushed
    }

    fn release(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.release(true);
        }
    }
}

impl Write for JoinableWriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        if written > 0 {
            self.joinable.append(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for JoinableWriteHandle {
    fn drop(&mut self) {
        if self.ticket.is_some() {
            if let Err(e) = self.file.flush() {
                tracing::warn!(
                    path = %self.joinable.path().display(),
                    error = %e,
                    "flush failed while dropping write handle"
                );
            }
            self.release();
        }
    }
}

/// Read side of a joinable stream.
///
/// Reads block only while the writer is still producing and no new bytes are
/// available; end-of-data is an ordinary 0-byte read.
pub struct JoinableReadHandle {
    joinable: Arc<JoinableFile>,
    pos: usize,
    ticket: Option<StreamTicket>,
}

impl JoinableReadHandle {
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.release(false);
        }
    }
}

impl Read for JoinableReadHandle {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.joinable.read_at(self.pos, out);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for JoinableReadHandle {
    fn drop(&mut self) {
        self.release();
    }
}
