//! Bidirectional inode ⇄ path table.
//!
//! The broker keys locks by path while the kernel speaks inodes, so the
//! proxy keeps both directions of the mapping. Paths are stored relative to
//! the backing root; the root itself is `FUSE_ROOT_ID` with an empty
//! relative path. Inode numbers are never reused within a mount session.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// The kernel's fixed root inode number.
pub const ROOT_INO: u64 = 1;

/// Inode table for one mount session.
#[derive(Debug)]
pub struct InodeTable {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Fresh table containing only the root.
    #[must_use]
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, PathBuf::new());
        by_path.insert(PathBuf::new(), ROOT_INO);
        Self {
            by_ino,
            by_path,
            next_ino: ROOT_INO + 1,
        }
    }

    /// Relative path for `ino`, if known.
    #[must_use]
    pub fn path_of(&self, ino: u64) -> Option<&PathBuf> {
        self.by_ino.get(&ino)
    }

    /// Inode for `path`, if known.
    #[must_use]
    pub fn ino_of(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    /// Inode for `path`, allocating one on first sight.
    pub fn ino_or_insert(&mut self, path: PathBuf) -> u64 {
        if let Some(ino) = self.by_path.get(&path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(ino, path.clone());
        self.by_path.insert(path, ino);
        ino
    }

    /// Child path under the directory `parent` refers to, or `None` when the
    /// parent inode is unknown.
    #[must_use]
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path_of(parent).map(|p| p.join(name))
    }

    /// Forget a path after unlink/rmdir. The inode stays allocated (the
    /// kernel may still hold a reference) but no longer resolves.
    pub fn forget_path(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    /// Rekey `old` and everything beneath it to live under `new`.
    pub fn rename_subtree(&mut self, old: &Path, new: &Path) {
        let affected: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_path() == old || p.starts_with(old))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (path, ino) in affected {
            self.by_path.remove(&path);
            let rebased = if path == old {
                new.to_path_buf()
            } else {
                new.join(path.strip_prefix(old).unwrap_or(&path))
            };
            self.by_ino.insert(ino, rebased.clone());
            self.by_path.insert(rebased, ino);
        }
    }

    /// A rename target that is replaced loses its old identity.
    pub fn replace_target(&mut self, target: &Path) {
        self.forget_path(target);
    }
}
