use std::collections::HashMap;
use fuser::FUSE_ROOT_ID;
use tracing::debug;
use crate::fs::resolver::child_path;

/// Two-way map between kernel inode numbers and virtual paths. Paths are
/// stored as object keys, so the root is the empty string.
///
/// Every inode handed to the kernel in an entry reply carries a lookup
/// count; the mapping is dropped once the kernel forgets all of them.
#[derive(Debug)]
pub struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    lookups: HashMap<u64, u64>,
    next_ino: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert(String::new(), FUSE_ROOT_ID);
        ino_to_path.insert(FUSE_ROOT_ID, String::new());
        Self {
            path_to_ino,
            ino_to_path,
            lookups: HashMap::new(),
            next_ino: FUSE_ROOT_ID + 1,
        }
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(String::as_str)
    }

    /// Inode currently assigned to `path`, without taking a reference.
    pub fn peek(&self, path: &str) -> Option<u64> {
        self.path_to_ino.get(path).copied()
    }

    pub fn child(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|p| child_path(p, name))
    }

    /// Inode of the parent directory; the root is its own parent.
    pub fn parent_ino(&self, ino: u64) -> u64 {
        let parent = self
            .path(ino)
            .and_then(|p| p.rsplit_once('/'))
            .map(|(parent, _)| parent)
            .unwrap_or("");
        self.peek(parent).unwrap_or(FUSE_ROOT_ID)
    }

    /// Inode for `path`, assigning one if needed, with one more kernel
    /// reference counted against it.
    pub fn lookup(&mut self, path: &str) -> u64 {
        let ino = match self.peek(path) {
            Some(ino) => ino,
            None => {
                let ino = self.next_ino;
                self.next_ino += 1;
                self.path_to_ino.insert(path.to_string(), ino);
                self.ino_to_path.insert(ino, path.to_string());
                debug!("inode {} -> {:?}", ino, path);
                ino
            }
        };
        *self.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    /// Drops `nlookup` kernel references; the last one frees the inode.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let Some(count) = self.lookups.get_mut(&ino) else {
            return;
        };
        *count = count.saturating_sub(nlookup);
        if *count > 0 {
            return;
        }
        self.lookups.remove(&ino);
        if let Some(path) = self.ino_to_path.remove(&ino) {
            if self.path_to_ino.get(&path) == Some(&ino) {
                self.path_to_ino.remove(&path);
            }
            debug!("inode {} forgotten ({:?})", ino, path);
        }
    }

    /// Unmaps `path`. Its lookup count stays until the kernel forgets it.
    pub fn remove(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    /// Moves `old` and every path below it to `new`, keeping inode numbers.
    pub fn rename(&mut self, old: &str, new: &str) {
        let old_prefix = format!("{}/", old);
        let moved: Vec<(String, u64)> = self
            .path_to_ino
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&old_prefix))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        self.remove(new);
        for (path, ino) in moved {
            self.path_to_ino.remove(&path);
            let renamed = format!("{}{}", new, &path[old.len()..]);
            // Drop whatever was cached at the destination.
            if let Some(stale) = self.path_to_ino.insert(renamed.clone(), ino) {
                self.ino_to_path.remove(&stale);
            }
            self.ino_to_path.insert(ino, renamed);
        }
    }

    /// Mapped inodes, the root included.
    pub fn len(&self) -> usize {
        self.ino_to_path.len()
    }
}
