//! Write handles and their local staging files.
//!
//! The store only accepts whole-object puts, so every write handle keeps the
//! object's bytes in a scratch file that absorbs random-offset writes until
//! the handle is flushed.

use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use crate::error::{FsError, Result};
use crate::storage::ObjectBody;

const UNFLUSHED_DIR: &str = "unflushed";

pub type Staging = Arc<NamedTempFile>;

#[derive(Debug)]
pub struct OpenHandle {
    pub id: u64,
    pub path: String,
    pub staging: Staging,
    pub known_size: u64,
    pub dirty: bool,
    /// Bumped by every write or truncate.
    pub generation: u64,
    /// Table clock at the last update; the highest wins attribute lookups.
    touched: u64,
}

/// Copy of a handle's state taken under the table lock.
#[derive(Debug, Clone)]
pub struct HandleView {
    pub id: u64,
    pub path: String,
    pub staging: Staging,
    pub known_size: u64,
    pub dirty: bool,
    pub generation: u64,
}

#[derive(Debug)]
pub struct HandleTable {
    handles: RwLock<HashMap<u64, OpenHandle>>,
    next_id: AtomicU64,
    clock: AtomicU64,
    staging_dir: PathBuf,
}

impl HandleTable {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            staging_dir: staging_dir.into(),
        }
    }

    /// Ids start at 1 and are never reused; 0 means "no handle".
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_staging(&self, id: u64) -> Result<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix(&format!("bucketfs-{}-", id))
            .suffix(".tmp")
            .tempfile_in(&self.staging_dir)?;
        debug!("staging file for handle {}: {:?}", id, file.path());
        Ok(file)
    }

    pub fn insert(&self, id: u64, path: &str, staging: NamedTempFile, size: u64, dirty: bool) {
        let handle = OpenHandle {
            id,
            path: path.to_string(),
            staging: Arc::new(staging),
            known_size: size,
            dirty,
            generation: 0,
            touched: self.tick(),
        };
        self.write_handles().insert(id, handle);
    }

    pub fn get(&self, id: u64) -> Option<HandleView> {
        self.read_handles().get(&id).map(|h| HandleView {
            id: h.id,
            path: h.path.clone(),
            staging: Arc::clone(&h.staging),
            known_size: h.known_size,
            dirty: h.dirty,
            generation: h.generation,
        })
    }

    /// Size of the most recently updated handle open on `path`.
    pub fn size_for_path(&self, path: &str) -> Option<u64> {
        self.read_handles()
            .values()
            .filter(|h| h.path == path)
            .max_by_key(|h| h.touched)
            .map(|h| h.known_size)
    }

    pub fn record_write(&self, id: u64, end: u64) {
        let touched = self.tick();
        if let Some(h) = self.write_handles().get_mut(&id) {
            h.known_size = h.known_size.max(end);
            h.dirty = true;
            h.generation += 1;
            h.touched = touched;
        }
    }

    pub fn record_truncate(&self, id: u64, size: u64) {
        let touched = self.tick();
        if let Some(h) = self.write_handles().get_mut(&id) {
            h.known_size = size;
            h.dirty = true;
            h.generation += 1;
            h.touched = touched;
        }
    }

    /// Clears `dirty` unless the handle changed after `generation` was read.
    pub fn mark_clean(&self, id: u64, generation: u64) -> bool {
        match self.write_handles().get_mut(&id) {
            Some(h) if h.generation == generation => {
                h.dirty = false;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: u64) -> Option<OpenHandle> {
        self.write_handles().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.read_handles().len()
    }

    /// Points handles open on `old` or below it at the renamed keys, so
    /// their next flush lands at the new location.
    pub fn rename_path(&self, old: &str, new: &str) -> usize {
        let old_prefix = format!("{}/", old);
        let mut moved = 0;
        for h in self.write_handles().values_mut() {
            if h.path == old || h.path.starts_with(&old_prefix) {
                h.path = format!("{}{}", new, &h.path[old.len()..]);
                moved += 1;
            }
        }
        moved
    }

    /// Copies the staging file of an unflushable handle next to the other
    /// staging files, under `unflushed/`.
    pub fn preserve(&self, handle: &OpenHandle) -> Result<PathBuf> {
        let dir = self.staging_dir.join(UNFLUSHED_DIR);
        std::fs::create_dir_all(&dir)?;
        let dest = dir.join(format!("{}-{}", handle.path.replace('/', "_"), handle.id));
        std::fs::copy(handle.staging.path(), &dest)?;
        Ok(dest)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn read_handles(&self) -> RwLockReadGuard<'_, HashMap<u64, OpenHandle>> {
        self.handles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_handles(&self) -> RwLockWriteGuard<'_, HashMap<u64, OpenHandle>> {
        self.handles.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(FsError::Io)
}

/// Streams `body` into an empty staging file, returning the bytes written.
/// On error the staging file is left empty.
pub async fn download(staging: &NamedTempFile, mut body: ObjectBody) -> Result<u64> {
    let mut file = tokio::fs::File::from_std(staging.reopen()?);
    match tokio::io::copy(&mut body.reader, &mut file).await {
        Ok(written) => {
            file.flush().await?;
            Ok(written)
        }
        Err(e) => {
            // A chunk may still be in flight on the blocking pool; set_len
            // waits for it before truncating.
            file.set_len(0).await?;
            Err(FsError::Io(e))
        }
    }
}

pub async fn write_at(staging: Staging, data: Vec<u8>, offset: u64) -> Result<()> {
    blocking(move || staging.as_file().write_all_at(&data, offset)).await
}

pub async fn set_len(staging: Staging, size: u64) -> Result<()> {
    blocking(move || staging.as_file().set_len(size)).await
}

/// Reads up to `len` bytes at `offset`; shorter at end of file.
pub async fn read_at(staging: Staging, len: usize, offset: u64) -> Result<Vec<u8>> {
    blocking(move || {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = staging.as_file().read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    })
    .await
}
