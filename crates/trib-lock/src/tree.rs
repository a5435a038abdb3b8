//! Path → entry registry with hierarchical lookup.
//!
//! The tree maps canonical paths to live [`FileEntry`] bookkeeping records.
//! The map itself is sharded (`DashMap`) so unrelated paths never contend;
//! blocking happens only on the per-entry mutex/condvar pair.
//!
//! Entries are created lazily on first lock/open and evicted eagerly once
//! their aggregate count returns to zero with no stream attached. Eviction
//! races with concurrent lookups are resolved with a `defunct` marker: a
//! looked-up entry found defunct is discarded and the lookup retried, so
//! callers always operate on a live record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;

use crate::joinable::JoinableFile;
use crate::owner::OwnerContext;
use crate::LockLevel;

/// Registry of currently tracked paths.
pub struct FileTree {
    entries: DashMap<PathBuf, Arc<FileEntry>>,
}

/// Per-path bookkeeping record: lock state plus an optional attached stream.
pub struct FileEntry {
    path: PathBuf,
    state: Mutex<EntryState>,
    changed: Condvar,
}

/// Interior lock state of one entry. Guarded by the entry mutex.
#[derive(Default)]
pub(crate) struct EntryState {
    /// `None` means unlocked.
    pub(crate) level: Option<LockLevel>,
    /// Nested acquisitions targeting this exact path, per owner.
    pub(crate) holds: HashMap<OwnerContext, u32>,
    /// Attributions rolled up from descendant operations and joined readers.
    pub(crate) rollups: HashMap<OwnerContext, u32>,
    /// First direct holder; retained while the aggregate count is non-zero.
    pub(crate) primary: Option<OwnerContext>,
    /// Present only while a stream is open on this exact path.
    pub(crate) joinable: Option<Arc<JoinableFile>>,
    /// Set under the state lock just before the entry leaves the tree.
    pub(crate) defunct: bool,
}

impl EntryState {
    /// Aggregate count: direct holds plus rollups.
    pub(crate) fn count(&self) -> u32 {
        self.holds.values().sum::<u32>() + self.rollups.values().sum::<u32>()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.count() == 0 && self.joinable.is_none()
    }

    fn sole_owner(&self, owner: &OwnerContext) -> bool {
        self.holds
            .keys()
            .chain(self.rollups.keys())
            .all(|held_by| held_by == owner)
    }

    /// May `owner` take (or pass through) a write-level acquisition here?
    pub(crate) fn write_compatible(&self, owner: &OwnerContext) -> bool {
        (self.level == Some(LockLevel::Write) && self.holds.contains_key(owner))
            || self.sole_owner(owner)
    }

    /// May `owner` take a read-level acquisition here?
    pub(crate) fn read_compatible(&self, owner: &OwnerContext) -> bool {
        match self.level {
            None | Some(LockLevel::Read) => true,
            Some(LockLevel::Write) => self.holds.contains_key(owner) || self.sole_owner(owner),
        }
    }

    pub(crate) fn add_hold(&mut self, owner: &OwnerContext, level: LockLevel) {
        *self.holds.entry(owner.clone()).or_insert(0) += 1;
        match (self.level, level) {
            (None, requested) => self.level = Some(requested),
            (Some(LockLevel::Read), LockLevel::Write) => self.level = Some(LockLevel::Write),
            _ => {}
        }
        if self.primary.is_none() {
            self.primary = Some(owner.clone());
        }
    }

    pub(crate) fn add_rollup(&mut self, owner: &OwnerContext) {
        *self.rollups.entry(owner.clone()).or_insert(0) += 1;
    }

    /// Release one direct hold; `false` if `owner` holds none (inert no-op).
    pub(crate) fn release_hold(&mut self, owner: &OwnerContext) -> bool {
        match self.holds.get_mut(owner) {
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    self.holds.remove(owner);
                }
            }
            None => return false,
        }
        self.settle();
        true
    }

    /// Release one rollup attribution; `false` if `owner` has none recorded.
    pub(crate) fn release_rollup(&mut self, owner: &OwnerContext) -> bool {
        match self.rollups.get_mut(owner) {
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    self.rollups.remove(owner);
                }
            }
            None => return false,
        }
        self.settle();
        true
    }

    fn settle(&mut self) {
        if self.count() == 0 {
            self.level = None;
            self.primary = None;
        }
    }
}

impl FileEntry {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(EntryState::default()),
            changed: Condvar::new(),
        }
    }

    /// Canonical identity of this entry; immutable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap()
    }

    /// Wake every waiter parked on this entry.
    pub(crate) fn notify_all(&self) {
        self.changed.notify_all();
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, EntryState>) -> MutexGuard<'a, EntryState> {
        self.changed.wait(guard).unwrap()
    }

    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, EntryState>,
        bound: Duration,
    ) -> MutexGuard<'a, EntryState> {
        self.changed.wait_timeout(guard, bound).unwrap().0
    }

    fn snapshot(&self) -> Option<EntrySnapshot> {
        let st = self.lock_state();
        if st.defunct {
            return None;
        }
        Some(EntrySnapshot {
            path: self.path.clone(),
            level: st.level,
            count: st.count(),
            has_stream: st.joinable.is_some(),
            owner: st.primary.as_ref().map(|o| o.to_string()),
        })
    }
}

/// Point-in-time view of one tracked entry, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub path: PathBuf,
    pub level: Option<LockLevel>,
    pub count: u32,
    pub has_stream: bool,
    pub owner: Option<String>,
}

impl FileTree {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// The live entry for `path`, creating an unlocked one if absent.
    /// Never fails; loops past entries concurrently marked defunct.
    pub(crate) fn get_or_create(&self, path: &Path) -> Arc<FileEntry> {
        loop {
            let entry = {
                let slot = self
                    .entries
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(FileEntry::new(path.to_path_buf())));
                Arc::clone(slot.value())
            };
            if !entry.lock_state().defunct {
                return entry;
            }
            // Lost a race with eviction; drop the stale record and retry.
            self.entries
                .remove_if(path, |_, current| Arc::ptr_eq(current, &entry));
        }
    }

    /// The entry for `path`, or `None`. Read-only queries use this so that
    /// querying an untouched path never allocates tracking state.
    pub(crate) fn get(&self, path: &Path) -> Option<Arc<FileEntry>> {
        self.entries.get(path).map(|r| Arc::clone(r.value()))
    }

    /// Proper ancestors of `path` that currently have live entries,
    /// nearest-first.
    pub(crate) fn tracked_ancestors(&self, path: &Path) -> Vec<Arc<FileEntry>> {
        let mut tracked = Vec::new();
        let mut cursor = path.parent();
        while let Some(ancestor) = cursor {
            if let Some(entry) = self.get(ancestor) {
                tracked.push(entry);
            }
            cursor = ancestor.parent();
        }
        tracked
    }

    /// Evict `entry` if it is idle (zero count, no stream). Returns whether
    /// the entry was removed. Waiters parked on the entry are woken so they
    /// re-resolve through the map.
    pub(crate) fn evict_if_idle(&self, entry: &Arc<FileEntry>) -> bool {
        {
            let mut st = entry.lock_state();
            if st.defunct || !st.is_idle() {
                return false;
            }
            st.defunct = true;
        }
        self.remove(entry);
        entry.notify_all();
        true
    }

    /// Remove `entry` from the tree. The caller must have verified the entry
    /// is idle; a removal while counts or a stream remain would corrupt the
    /// bookkeeping every operation relies on, so it is a fatal fault.
    fn remove(&self, entry: &Arc<FileEntry>) {
        {
            let st = entry.lock_state();
            if st.count() != 0 || st.joinable.is_some() {
                panic!(
                    "file entry {} removed while still in use (count {}, stream {})",
                    entry.path().display(),
                    st.count(),
                    st.joinable.is_some(),
                );
            }
        }
        self.entries
            .remove_if(entry.path(), |_, current| Arc::ptr_eq(current, entry));
    }

    /// Apply `action` to a snapshot of every tracked entry matching
    /// `predicate`. Finite and restartable: each call re-enumerates the
    /// current state. This is the introspection surface used by tests and
    /// monitoring to assert full cleanup.
    pub fn for_all<P, A>(&self, predicate: P, mut action: A)
    where
        P: Fn(&EntrySnapshot) -> bool,
        A: FnMut(&EntrySnapshot),
    {
        for item in self.entries.iter() {
            if let Some(snapshot) = item.value().snapshot() {
                if predicate(&snapshot) {
                    action(&snapshot);
                }
            }
        }
    }

    /// Number of currently tracked entries.
    pub fn tracked_count(&self) -> usize {
        let mut n = 0;
        self.for_all(|_| true, |_| n += 1);
        n
    }
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}
