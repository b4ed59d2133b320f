use std::ffi::{c_int, OsStr};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use fuser::{
    BackgroundSession, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use crate::error::FsError;
use crate::fs::{Entry, PathFilesystem};
use crate::posix::{self, Ownership};

mod inode;

pub use inode::InodeTable;

const TTL: Duration = Duration::from_secs(1);

/// Handle number given to the kernel for opens that need no write handle.
const NO_HANDLE: u64 = 0;

/// `d_ino` for directory entries that have not been looked up yet.
const UNKNOWN_INO: u64 = 0xffff_ffff;

fn handle_arg(fh: u64) -> Option<u64> {
    (fh != NO_HANDLE).then_some(fh)
}

fn opens_for_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

/// Logs and converts an adapter error into an errno for the kernel.
fn errno(op: &str, path: &str, err: &FsError) -> c_int {
    if err.is_not_found() {
        debug!("{}: {:?} not found", op, path);
    } else {
        error!("{} error for path={:?}: {}", op, path, err);
    }
    err.errno()
}

/// Bridges `fuser`'s inode callbacks onto a path-based [`PathFilesystem`].
///
/// The session thread is not a runtime thread, so every async call is driven
/// to completion with [`Handle::block_on`].
pub struct FuseAdapter {
    fs: Arc<dyn PathFilesystem>,
    inodes: InodeTable,
    runtime: Handle,
    owner: Ownership,
}

impl FuseAdapter {
    pub fn new(fs: Arc<dyn PathFilesystem>, runtime: Handle) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            runtime,
            owner: Ownership::current(),
        }
    }

    /// Mounts on a background thread; dropping the session unmounts.
    pub fn spawn(self, mount_point: &Path, fs_name: &str) -> std::io::Result<BackgroundSession> {
        let options = [
            MountOption::FSName(fs_name.to_string()),
            MountOption::DefaultPermissions,
            MountOption::RW,
        ];
        info!("Mounting {} at {:?}", fs_name, mount_point);
        fuser::spawn_mount2(self, mount_point, &options)
    }

    fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.runtime.block_on(f)
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.path(ino).map(str::to_string)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let Some(name) = name.to_str() else {
            let err = FsError::InvalidPath(name.to_string_lossy().into_owned());
            warn!("non UTF-8 name under inode {}: {}", parent, err);
            return Err(err.errno());
        };
        self.inodes.child(parent, name).ok_or(ENOENT)
    }

    /// Attributes for an entry reply; the kernel holds one lookup on `ino`.
    fn entry_attr(&mut self, path: &str, entry: &Entry) -> fuser::FileAttr {
        let ino = self.inodes.lookup(path);
        posix::file_attr(ino, entry, self.owner)
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("filesystem initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("filesystem unmounted, {} inodes still mapped", self.inodes.len());
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!("lookup: {:?}", path);
        match self.block_on(self.fs.getattr(&path)) {
            Ok(entry) => {
                let attr = self.entry_attr(&path, &entry);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(errno("lookup", &path, &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            error!("getattr: unknown inode {}", ino);
            return reply.error(ENOENT);
        };
        match self.block_on(self.fs.getattr(&path)) {
            Ok(entry) => reply.attr(&TTL, &posix::file_attr(ino, &entry, self.owner)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        debug!("setattr: {:?} size={:?} mode={:?} fh={:?}", path, size, mode, fh);
        if let Some(size) = size {
            let handle = fh.and_then(handle_arg);
            if let Err(e) = self.block_on(self.fs.truncate(&path, size, handle)) {
                return reply.error(errno("setattr", &path, &e));
            }
        }
        match self.block_on(self.fs.getattr(&path)) {
            Ok(entry) => reply.attr(&TTL, &posix::file_attr(ino, &entry, self.owner)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        debug!("mkdir: {:?}, mode={:o}", path, mode);
        match self.block_on(self.fs.mkdir(&path)) {
            Ok(()) => {
                let attr = self.entry_attr(&path, &Entry::Directory);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.unlink(&path)) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.rmdir(&path)) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE and RENAME_EXCHANGE cannot be honoured over copy+delete.
            return reply.error(EINVAL);
        }
        let (old, new) = match (self.child_of(parent, name), self.child_of(newparent, newname)) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        let result = self.block_on(self.fs.rename(&old, &new));
        // Keys may have moved even when the rename failed part way.
        self.inodes.rename(&old, &new);
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", &old, &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        match self.block_on(self.fs.open(&path, opens_for_write(flags))) {
            Ok(handle) => reply.opened(handle.unwrap_or(NO_HANDLE), 0),
            Err(e) => reply.error(errno("open", &path, &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.create(&path, mode)) {
            Ok(handle) => {
                let entry = Entry::File {
                    size: 0,
                    mtime: SystemTime::now(),
                };
                let attr = self.entry_attr(&path, &entry);
                reply.created(&TTL, &attr, 0, handle, 0);
            }
            Err(e) => reply.error(errno("create", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        let mut buf = vec![0u8; size as usize];
        let offset = offset.max(0) as u64;
        match self.block_on(self.fs.read(&path, handle_arg(fh), &mut buf, offset)) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno("read", &path, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = self.path_of(ino).unwrap_or_default();
        match self.block_on(self.fs.write(fh, data, offset.max(0) as u64)) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", &path, &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(handle) = handle_arg(fh) else {
            return reply.ok();
        };
        match self.block_on(self.fs.flush(handle)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &self.path_of(ino).unwrap_or_default(), &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = handle_arg(fh) else {
            return reply.ok();
        };
        match self.block_on(self.fs.release(handle)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &self.path_of(ino).unwrap_or_default(), &e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        match self.block_on(self.fs.opendir(&path)) {
            Ok(()) => reply.opened(NO_HANDLE, 0),
            Err(e) => reply.error(errno("opendir", &path, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        let entries = match self.block_on(self.fs.readdir(&path)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno("readdir", &path, &e)),
        };
        debug!("readdir: {:?}, offset={}, {} entries", path, offset, entries.len());

        let parent = self.inodes.parent_ino(ino);
        for (i, child) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let (child_ino, kind) = match child.name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => (parent, FileType::Directory),
                name => {
                    // Listing takes no kernel reference, so unseen names get
                    // no inode until they are looked up.
                    let child_ino = self
                        .inodes
                        .peek(&crate::fs::resolver::child_path(&path, name))
                        .unwrap_or(UNKNOWN_INO);
                    let kind = if child.entry.is_dir() { FileType::Directory } else { FileType::RegularFile };
                    (child_ino, kind)
                }
            };
            if reply.add(child_ino, (i + 1) as i64, kind, &child.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        let path = self.path_of(ino).unwrap_or_default();
        match self.block_on(self.fs.releasedir(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("releasedir", &path, &e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let c = self.block_on(self.fs.statfs());
        reply.statfs(
            c.total_blocks,
            c.free_blocks,
            c.free_blocks,
            c.total_files,
            c.free_files,
            c.block_size as u32,
            c.name_max,
            c.block_size as u32,
        );
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        match self.block_on(self.fs.access(&path, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &path, &e)),
        }
    }
}
