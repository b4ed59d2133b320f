use std::sync::Arc;
use std::time::SystemTime;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use crate::cache::{Capacity, CacheStats, ListingCache};
use crate::config::FsOptions;
use crate::error::{FsError, Result};
use crate::storage::{ObjectStore, PutSource};

pub mod handles;
pub mod resolver;

pub use handles::HandleTable;
pub use resolver::{DirEntry, Entry};

/// The callback set a driver host invokes. Paths are virtual paths; a single
/// leading `/` is ignored. Handle `0` is never issued.
#[async_trait]
pub trait PathFilesystem: Send + Sync + std::fmt::Debug {
    async fn getattr(&self, path: &str) -> Result<Entry>;
    async fn opendir(&self, path: &str) -> Result<()>;
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>>;
    async fn releasedir(&self, path: &str) -> Result<()>;
    /// `None` for read-only opens, which are served straight from the store.
    async fn open(&self, path: &str, write: bool) -> Result<Option<u64>>;
    async fn create(&self, path: &str, mode: u32) -> Result<u64>;
    async fn read(&self, path: &str, handle: Option<u64>, buf: &mut [u8], offset: u64) -> Result<usize>;
    async fn write(&self, handle: u64, data: &[u8], offset: u64) -> Result<usize>;
    async fn truncate(&self, path: &str, size: u64, handle: Option<u64>) -> Result<()>;
    async fn flush(&self, handle: u64) -> Result<()>;
    async fn release(&self, handle: u64) -> Result<()>;
    async fn unlink(&self, path: &str) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;
    async fn access(&self, path: &str, mask: i32) -> Result<()>;
    async fn statfs(&self) -> Capacity;
}

/// A bucket presented as a filesystem.
#[derive(Debug)]
pub struct BucketFs {
    store: Arc<dyn ObjectStore>,
    cache: ListingCache,
    handles: HandleTable,
    options: FsOptions,
}

impl BucketFs {
    pub fn new(store: Arc<dyn ObjectStore>, options: FsOptions) -> Self {
        let cache = ListingCache::new(options.list_ttl(), options.capacity_ttl());
        let handles = HandleTable::new(options.staging_dir());
        Self {
            store,
            cache,
            handles,
            options,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn new_handle(&self) -> Result<(u64, tempfile::NamedTempFile)> {
        let id = self.handles.allocate_id();
        let staging = self.handles.create_staging(id)?;
        Ok((id, staging))
    }

    /// `keys` includes the `old_prefix` marker when there is one, so an empty
    /// directory moves through the same copy loop as its marker.
    async fn rename_dir(&self, old_prefix: &str, new_prefix: &str, keys: &[String]) -> Result<()> {
        for (moved, key) in keys.iter().enumerate() {
            let dest = format!("{}{}", new_prefix, &key[old_prefix.len()..]);
            let step = match self.store.copy(key, &dest).await {
                Ok(()) => self.store.delete(key).await,
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                // Keys already moved stay moved; nothing is rolled back.
                error!(
                    "rename: failed at {:?} after moving {} of {} keys, bucket left partially renamed: {}",
                    key,
                    moved,
                    keys.len(),
                    e
                );
                return Err(e);
            }
            debug!("rename: moved {:?} -> {:?}", key, dest);
        }
        Ok(())
    }

    async fn rename_file(&self, old_key: &str, new_key: &str) -> Result<()> {
        self.store.copy(old_key, new_key).await?;
        if let Err(e) = self.store.delete(old_key).await {
            warn!("rename: copied {:?} to {:?} but could not delete the source: {}", old_key, new_key, e);
        }
        Ok(())
    }
}

#[async_trait]
impl PathFilesystem for BucketFs {
    async fn getattr(&self, path: &str) -> Result<Entry> {
        let key = resolver::to_key(path);
        if key.is_empty() {
            return Ok(Entry::Directory);
        }
        if let Some(size) = self.handles.size_for_path(key) {
            debug!("getattr: {:?} shadowed by open handle, size={}", key, size);
            return Ok(Entry::File {
                size,
                mtime: SystemTime::now(),
            });
        }
        let listing = self.cache.listing(self.store.as_ref()).await?;
        resolver::lookup(&listing, key).ok_or_else(|| FsError::NotFound(key.to_string()))
    }

    async fn opendir(&self, path: &str) -> Result<()> {
        debug!("opendir: {:?}", path);
        Ok(())
    }

    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let key = resolver::to_key(path);
        let listing = self.cache.listing(self.store.as_ref()).await?;
        let entries = resolver::children(&listing, key);
        debug!("readdir: {:?} has {} entries", key, entries.len() - 2);
        Ok(entries)
    }

    async fn releasedir(&self, path: &str) -> Result<()> {
        debug!("releasedir: {:?}", path);
        Ok(())
    }

    async fn open(&self, path: &str, write: bool) -> Result<Option<u64>> {
        let key = resolver::to_key(path);
        if !write {
            debug!("open: {:?} read-only", key);
            return Ok(None);
        }

        let (id, staging) = self.new_handle()?;
        let size = match self.store.get(key).await {
            Ok(body) => match handles::download(&staging, body).await {
                Ok(size) => size,
                Err(e) => {
                    if staging.as_file().metadata()?.len() != 0 {
                        error!("open: download of {:?} failed and staging could not be emptied: {}", key, e);
                        return Err(e);
                    }
                    warn!("open: download of {:?} failed, starting empty: {}", key, e);
                    0
                }
            },
            Err(e) if e.is_not_found() => 0,
            Err(e) => {
                warn!("open: could not fetch {:?}, starting empty: {}", key, e);
                0
            }
        };
        self.handles.insert(id, key, staging, size, false);
        info!("open: handle {} for {:?}, size={}", id, key, size);
        Ok(Some(id))
    }

    async fn create(&self, path: &str, mode: u32) -> Result<u64> {
        let key = resolver::to_key(path);
        let (id, staging) = self.new_handle()?;
        // Dirty from the start so that a create with no writes still stores
        // an empty object on flush.
        self.handles.insert(id, key, staging, 0, true);
        info!("create: handle {} for {:?}, mode={:o}", id, key, mode);
        Ok(id)
    }

    async fn read(&self, path: &str, handle: Option<u64>, buf: &mut [u8], offset: u64) -> Result<usize> {
        if let Some(view) = handle.and_then(|id| self.handles.get(id)) {
            let data = handles::read_at(view.staging, buf.len(), offset).await?;
            buf[..data.len()].copy_from_slice(&data);
            debug!("read: {:?} {} bytes at {} from handle {}", view.path, data.len(), offset, view.id);
            return Ok(data.len());
        }

        let key = resolver::to_key(path);
        let body = self.store.get_range(key, offset, buf.len() as u64).await?;
        let n = body.read_into(buf).await?;
        debug!("read: {:?} {} bytes at {}", key, n, offset);
        Ok(n)
    }

    async fn write(&self, handle: u64, data: &[u8], offset: u64) -> Result<usize> {
        let view = self.handles.get(handle).ok_or(FsError::BadHandle(handle))?;
        handles::write_at(view.staging, data.to_vec(), offset).await?;
        self.handles.record_write(handle, offset + data.len() as u64);
        debug!("write: handle {} {} bytes at {}", handle, data.len(), offset);
        Ok(data.len())
    }

    async fn truncate(&self, path: &str, size: u64, handle: Option<u64>) -> Result<()> {
        let key = resolver::to_key(path);
        match handle {
            Some(id) => {
                let view = self.handles.get(id).ok_or(FsError::BadHandle(id))?;
                handles::set_len(view.staging, size).await?;
                self.handles.record_truncate(id, size);
                debug!("truncate: handle {} to {}", id, size);
                Ok(())
            }
            None if size == 0 => {
                self.store.put(key, PutSource::Empty).await?;
                self.cache.invalidate();
                info!("truncate: stored empty object at {:?}", key);
                Ok(())
            }
            None => Err(FsError::Unsupported(format!(
                "truncate {:?} to {} without an open handle",
                key, size
            ))),
        }
    }

    async fn flush(&self, handle: u64) -> Result<()> {
        let Some(view) = self.handles.get(handle) else {
            return Ok(());
        };
        if !view.dirty {
            return Ok(());
        }
        let source = PutSource::File(view.staging.path().to_path_buf());
        if let Err(e) = self.store.put(&view.path, source).await {
            error!("flush: upload of {:?} (handle {}) failed: {}", view.path, handle, e);
            return Err(e);
        }
        self.handles.mark_clean(handle, view.generation);
        self.cache.invalidate();
        info!("flush: uploaded {:?} ({} bytes)", view.path, view.known_size);
        Ok(())
    }

    async fn release(&self, handle: u64) -> Result<()> {
        let attempts = self.options.release_flush_attempts.max(1);
        let mut result = Ok(());
        for attempt in 1..=attempts {
            result = self.flush(handle).await;
            match &result {
                Ok(()) => break,
                Err(e) => warn!("release: flush attempt {}/{} for handle {} failed: {}", attempt, attempts, handle, e),
            }
        }

        let Some(open) = self.handles.remove(handle) else {
            return Ok(());
        };
        if let Err(e) = &result {
            if self.options.preserve_unflushed {
                match self.handles.preserve(&open) {
                    Ok(kept) => error!("release: {:?} was not stored ({}), content kept at {:?}", open.path, e, kept),
                    Err(copy_err) => error!("release: {:?} was not stored ({}) and could not be kept: {}", open.path, e, copy_err),
                }
            } else {
                error!("release: {:?} was not stored ({}), unflushed data discarded", open.path, e);
            }
        }
        debug!("release: handle {} closed", handle);
        result
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let key = resolver::to_key(path);
        self.store.delete(key).await?;
        self.cache.invalidate();
        info!("unlink: {:?}", key);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let key = resolver::to_key(path);
        self.store.put(&format!("{}/", key), PutSource::Empty).await?;
        self.cache.invalidate();
        info!("mkdir: {:?}", key);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let key = resolver::to_key(path);
        let marker = format!("{}/", key);
        let objects = self.store.list(&marker).await?;
        if objects.iter().any(|o| o.key != marker) {
            return Err(FsError::NotEmpty(key.to_string()));
        }
        match self.store.delete(&marker).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("rmdir: no marker for {:?}", key),
            Err(e) => return Err(e),
        }
        self.cache.invalidate();
        info!("rmdir: {:?}", key);
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_key = resolver::to_key(old_path);
        let new_key = resolver::to_key(new_path);
        let old_prefix = format!("{}/", old_key);
        let new_prefix = format!("{}/", new_key);

        let objects = self.store.list("").await?;
        let keys: Vec<String> = objects
            .iter()
            .filter(|o| o.key.starts_with(&old_prefix))
            .map(|o| o.key.clone())
            .collect();

        let result = if !keys.is_empty() {
            info!("rename: directory {:?} -> {:?} ({} keys)", old_key, new_key, keys.len());
            self.rename_dir(&old_prefix, &new_prefix, &keys).await
        } else {
            info!("rename: file {:?} -> {:?}", old_key, new_key);
            self.rename_file(old_key, new_key).await
        };
        // Invalidate even after a partial move so listings show the real state.
        self.cache.invalidate();
        if result.is_ok() {
            let moved = self.handles.rename_path(old_key, new_key);
            if moved > 0 {
                debug!("rename: {} open handles now point below {:?}", moved, new_key);
            }
        }
        result
    }

    async fn access(&self, path: &str, mask: i32) -> Result<()> {
        debug!("access: {:?} mask={}", path, mask);
        Ok(())
    }

    async fn statfs(&self) -> Capacity {
        self.cache.capacity(self.store.as_ref()).await
    }
}

#[cfg(test)]
mod tests;
