/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Inode table: a bidirectional `ino <-> virtual path` map owned by
//! the fuser binding layer (`src/fs.rs`), not by the dispatcher.
//!
//! This is transport glue, not part of the core described in spec §2
//! ("the kernel-to-userspace filesystem transport... is out of
//! scope"): the core dispatcher is entirely path-keyed. `fuser`'s
//! `Filesystem` trait is inode-keyed, so something has to bridge the
//! two; this is it.
//!
//! Modelled on a forward/reverse bimap (object ids there, paths here),
//! adapted so that a `rename` rewrites every inode whose path had the
//! old path as a prefix rather than invalidating them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inode number reserved for the mount root (`/`), matching `fuser`'s
/// convention that `FUSE_ROOT_ID == 1`.
pub const ROOT_INO: u64 = 1;

pub struct Inodes {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl Inodes {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, PathBuf::from("/"));
        by_path.insert(PathBuf::from("/"), ROOT_INO);
        Inodes {
            by_ino,
            by_path,
            next_ino: ROOT_INO + 1,
        }
    }

    /// Resolve a known inode to its virtual path.
    pub fn path_of(&self, ino: u64) -> Option<&Path> {
        self.by_ino.get(&ino).map(PathBuf::as_path)
    }

    /// Look up or allocate the inode for a virtual path.
    pub fn get_or_allocate(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(ino, path.to_path_buf());
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// After a successful rename, rewrite every tracked path that was
    /// `from` or lived under it, so inodes the kernel still holds keep
    /// resolving to the right backing path.
    pub fn on_rename(&mut self, from: &Path, to: &Path) {
        let affected: Vec<(u64, PathBuf)> = self
            .by_ino
            .iter()
            .filter(|(_, p)| p.as_path() == from || p.starts_with(from))
            .map(|(&ino, p)| (ino, p.clone()))
            .collect();

        for (ino, old_path) in affected {
            let new_path = if old_path == from {
                to.to_path_buf()
            } else {
                let suffix = old_path.strip_prefix(from).expect("checked by filter");
                to.join(suffix)
            };
            self.by_path.remove(&old_path);
            self.by_ino.insert(ino, new_path.clone());
            self.by_path.insert(new_path, ino);
        }
    }

    /// Drop the mapping for an inode the kernel has forgotten.
    pub fn forget(&mut self, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        if let Some(path) = self.by_ino.remove(&ino) {
            self.by_path.remove(&path);
        }
    }
}

impl Default for Inodes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preallocated() {
        let inodes = Inodes::new();
        assert_eq!(inodes.path_of(ROOT_INO), Some(Path::new("/")));
    }

    #[test]
    fn allocation_is_stable_for_the_same_path() {
        let mut inodes = Inodes::new();
        let a = inodes.get_or_allocate(Path::new("/a"));
        let b = inodes.get_or_allocate(Path::new("/a"));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_paths_get_distinct_inodes() {
        let mut inodes = Inodes::new();
        let a = inodes.get_or_allocate(Path::new("/a"));
        let b = inodes.get_or_allocate(Path::new("/b"));
        assert_ne!(a, b);
    }

    #[test]
    fn rename_rewrites_exact_match() {
        let mut inodes = Inodes::new();
        let ino = inodes.get_or_allocate(Path::new("/a"));
        inodes.on_rename(Path::new("/a"), Path::new("/b"));
        assert_eq!(inodes.path_of(ino), Some(Path::new("/b")));
    }

    #[test]
    fn rename_rewrites_children() {
        let mut inodes = Inodes::new();
        let dir = inodes.get_or_allocate(Path::new("/a"));
        let child = inodes.get_or_allocate(Path::new("/a/child.txt"));
        inodes.on_rename(Path::new("/a"), Path::new("/b"));
        assert_eq!(inodes.path_of(dir), Some(Path::new("/b")));
        assert_eq!(inodes.path_of(child), Some(Path::new("/b/child.txt")));
    }

    #[test]
    fn forget_drops_the_mapping() {
        let mut inodes = Inodes::new();
        let ino = inodes.get_or_allocate(Path::new("/a"));
        inodes.forget(ino);
        assert_eq!(inodes.path_of(ino), None);
    }

    #[test]
    fn forget_ignores_root() {
        let mut inodes = Inodes::new();
        inodes.forget(ROOT_INO);
        assert_eq!(inodes.path_of(ROOT_INO), Some(Path::new("/")));
    }
}
