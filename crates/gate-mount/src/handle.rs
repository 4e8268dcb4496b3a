//! Open-handle table.
//!
//! Every open mints a fresh owner token and holds its lock for the handle's
//! lifetime. Metadata operations on a path with an open handle reuse that
//! handle's owner token — but only when the held mode covers what the
//! operation needs, so a lock upgrade is never requested re-entrantly.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

use gate_core::protocol::{LockMode, OwnerToken};

/// Per-handle lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Lock held; reads/writes served; heartbeats flowing.
    Open,
    /// The flush path already released the lock (legacy policy); the handle
    /// only awaits its final release call.
    Flushed,
    /// Lease lost or broker said `not_held`; every subsequent operation
    /// fails with `EIO`.
    Lost,
}

/// One open file handle and the lock backing it.
#[derive(Debug)]
pub struct OpenHandle {
    /// Relative path within the backing tree.
    pub rel_path: PathBuf,
    /// Broker lock key (absolute backing path).
    pub lock_key: String,
    /// Owner token minted for this open.
    pub owner: OwnerToken,
    /// Mode of the held lock.
    pub mode: LockMode,
    /// Lifecycle state.
    pub state: HandleState,
    /// Backing file.
    pub file: File,
}

/// Handle table shared between the filesystem and the heartbeat task.
#[derive(Debug, Default)]
pub struct HandleTable {
    handles: HashMap<u64, OpenHandle>,
    next_fh: u64,
}

impl HandleTable {
    /// Register a handle, returning its kernel-visible id.
    pub fn insert(&mut self, handle: OpenHandle) -> u64 {
        self.next_fh += 1;
        let fh = self.next_fh;
        self.handles.insert(fh, handle);
        fh
    }

    /// Look up a handle.
    #[must_use]
    pub fn get(&self, fh: u64) -> Option<&OpenHandle> {
        self.handles.get(&fh)
    }

    /// Look up a handle mutably.
    pub fn get_mut(&mut self, fh: u64) -> Option<&mut OpenHandle> {
        self.handles.get_mut(&fh)
    }

    /// Remove a handle, returning it for final release.
    pub fn remove(&mut self, fh: u64) -> Option<OpenHandle> {
        self.handles.remove(&fh)
    }

    /// The owner token of an open handle on `lock_key` whose held mode
    /// covers `needed`. This is the reuse rule that lets a write-then-chmod
    /// sequence from one editor re-enter its own lock instead of deadlocking
    /// behind it.
    #[must_use]
    pub fn reusable_owner(&self, lock_key: &str, needed: LockMode) -> Option<OwnerToken> {
        self.handles
            .values()
            .find(|h| {
                h.state == HandleState::Open && h.lock_key == lock_key && h.mode.covers(needed)
            })
            .map(|h| h.owner.clone())
    }

    /// `(fh, lock_key, owner)` for every handle that should heartbeat.
    #[must_use]
    pub fn heartbeat_targets(&self) -> Vec<(u64, String, OwnerToken)> {
        self.handles
            .iter()
            .filter(|(_, h)| h.state == HandleState::Open)
            .map(|(fh, h)| (*fh, h.lock_key.clone(), h.owner.clone()))
            .collect()
    }

    /// Mark a handle lost; subsequent operations on it fail with `EIO`.
    pub fn mark_lost(&mut self, fh: u64) {
        if let Some(handle) = self.handles.get_mut(&fh) {
            handle.state = HandleState::Lost;
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(lock_key: &str, mode: LockMode, state: HandleState) -> OpenHandle {
        OpenHandle {
            rel_path: PathBuf::from("f"),
            lock_key: lock_key.to_string(),
            owner: OwnerToken::mint(),
            mode,
            state,
            file: tempfile::tempfile().unwrap(),
        }
    }

    #[test]
    fn fh_ids_are_unique_and_stable() {
        let mut table = HandleTable::default();
        let a = table.insert(handle("/r/a", LockMode::Read, HandleState::Open));
        let b = table.insert(handle("/r/b", LockMode::Write, HandleState::Open));
        assert_ne!(a, b);
        assert_eq!(table.get(a).unwrap().lock_key, "/r/a");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn write_handle_owner_is_reusable_for_both_modes() {
        let mut table = HandleTable::default();
        let fh = table.insert(handle("/r/f", LockMode::Write, HandleState::Open));
        let owner = table.get(fh).unwrap().owner.clone();

        assert_eq!(table.reusable_owner("/r/f", LockMode::Write), Some(owner.clone()));
        assert_eq!(table.reusable_owner("/r/f", LockMode::Read), Some(owner));
        assert_eq!(table.reusable_owner("/r/other", LockMode::Read), None);
    }

    #[test]
    fn read_handle_owner_is_not_reused_for_writes() {
        let mut table = HandleTable::default();
        table.insert(handle("/r/f", LockMode::Read, HandleState::Open));
        assert!(table.reusable_owner("/r/f", LockMode::Write).is_none());
        assert!(table.reusable_owner("/r/f", LockMode::Read).is_some());
    }

    #[test]
    fn lost_handles_neither_reuse_nor_heartbeat() {
        let mut table = HandleTable::default();
        let fh = table.insert(handle("/r/f", LockMode::Write, HandleState::Open));
        assert_eq!(table.heartbeat_targets().len(), 1);

        table.mark_lost(fh);
        assert!(table.reusable_owner("/r/f", LockMode::Read).is_none());
        assert!(table.heartbeat_targets().is_empty());
        assert_eq!(table.get(fh).unwrap().state, HandleState::Lost);
    }

    #[test]
    fn remove_returns_the_handle_once() {
        let mut table = HandleTable::default();
        let fh = table.insert(handle("/r/f", LockMode::Write, HandleState::Open));
        assert!(table.remove(fh).is_some());
        assert!(table.remove(fh).is_none());
        assert!(table.is_empty());
    }
}
