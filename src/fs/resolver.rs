//! Directory emulation over a flat key space.
//!
//! The bucket has no directories: a path is a directory when an explicit
//! marker key (`path/`) exists or when any key lives under `path/`. Both
//! attribute lookup and enumeration are prefix scans over one listing.

use std::collections::HashSet;
use std::time::SystemTime;
use crate::storage::ObjectInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    File { size: u64, mtime: SystemTime },
    Directory,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory)
    }

    fn of(object: &ObjectInfo) -> Self {
        if object.is_dir {
            Entry::Directory
        } else {
            Entry::File {
                size: object.size,
                mtime: object.last_modified,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub entry: Entry,
}

impl DirEntry {
    fn dir(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entry: Entry::Directory,
        }
    }
}

/// Object key for a virtual path: one leading `/` is dropped, nothing else.
pub fn to_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

pub fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Resolves a non-root key against `listing`.
pub fn lookup(listing: &[ObjectInfo], key: &str) -> Option<Entry> {
    let marker = format!("{}/", key);
    if let Some(object) = listing.iter().find(|o| o.key == key || o.key == marker) {
        return Some(Entry::of(object));
    }
    listing
        .iter()
        .any(|o| o.key.starts_with(&marker))
        .then_some(Entry::Directory)
}

/// Immediate children of `key`, preceded by `.` and `..`, in listing order.
/// A name sharing several keys is reported once, the first occurrence wins.
pub fn children(listing: &[ObjectInfo], key: &str) -> Vec<DirEntry> {
    let prefix = if key.is_empty() { String::new() } else { format!("{}/", key) };
    let mut seen = HashSet::new();
    let mut entries = vec![DirEntry::dir("."), DirEntry::dir("..")];

    for object in listing {
        let Some(rest) = object.key.strip_prefix(prefix.as_str()) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let (name, entry) = match rest.split_once('/') {
            Some((first, _)) => (first, Entry::Directory),
            None => (rest, Entry::of(object)),
        };
        // `a//b` has an empty segment that cannot be presented as a name.
        if name.is_empty() || !seen.insert(name) {
            continue;
        }
        entries.push(DirEntry {
            name: name.to_string(),
            entry,
        });
    }
    entries
}
