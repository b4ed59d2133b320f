//! POSIX attributes for bucket entries.
//!
//! The bucket stores no ownership or permission bits, so every entry belongs
//! to the user running the mount and is readable and writable by everyone.

use std::time::SystemTime;
use fuser::{FileAttr, FileType};
use rustix::fs::Mode;
use rustix::process::{getgid, getuid, Gid, Uid};
use crate::fs::Entry;

/// Preferred I/O size reported in `st_blksize`.
pub const BLKSIZE: u32 = 4096;
/// `st_blocks` is counted in 512-byte units regardless of `BLKSIZE`.
const STAT_BLOCK: u64 = 512;

pub fn dir_mode() -> Mode {
    Mode::RWXU | Mode::RWXG | Mode::RWXO
}

pub fn file_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Uid,
    pub gid: Gid,
}

impl Ownership {
    /// Owner of the mounting process.
    pub fn current() -> Self {
        Self {
            uid: getuid(),
            gid: getgid(),
        }
    }
}

pub fn blocks_for(size: u64) -> u64 {
    size.div_ceil(STAT_BLOCK)
}

pub fn file_attr(ino: u64, entry: &Entry, owner: Ownership) -> FileAttr {
    let (kind, size, mtime, mode, nlink) = match *entry {
        Entry::File { size, mtime } => (FileType::RegularFile, size, mtime, file_mode(), 1),
        // Directories carry no timestamp of their own.
        Entry::Directory => (FileType::Directory, 0, SystemTime::now(), dir_mode(), 2),
    };
    FileAttr {
        ino,
        size,
        blocks: blocks_for(size),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm: mode.bits() as u16,
        nlink,
        uid: owner.uid.as_raw(),
        gid: owner.gid.as_raw(),
        rdev: 0,
        flags: 0,
        blksize: BLKSIZE,
    }
}
