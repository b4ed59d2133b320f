//! In-process bucket. Backs the test suite and `--memory` mounts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use std::time::SystemTime;
use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;
use crate::error::{FsError, Result};
use super::{ObjectBody, ObjectInfo, ObjectStore, PutSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Get,
    Put,
    Delete,
    Copy,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: SystemTime,
    version: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    /// (op, Some(key)) fails that key only, (op, None) fails every call.
    failures: RwLock<HashSet<(StoreOp, Option<String>)>>,
    /// Keys whose bodies break off after the given number of bytes.
    interrupted: RwLock<HashMap<String, usize>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    versions: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects<I, K, V>(objects: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let store = Self::new();
        for (key, data) in objects {
            store.insert(key, data);
        }
        store
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) as u64;
        self.write_objects().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                modified: SystemTime::now(),
                version,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.read_objects().get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.read_objects().keys().cloned().collect()
    }

    /// Makes every `op` on `key` fail until [`MemoryStore::clear_failures`].
    pub fn fail(&self, op: StoreOp, key: impl Into<String>) {
        self.write_failures().insert((op, Some(key.into())));
    }

    pub fn fail_all(&self, op: StoreOp) {
        self.write_failures().insert((op, None));
    }

    /// Makes `get` on `key` stream `after` bytes and then fail with a
    /// connection reset, until [`MemoryStore::clear_failures`].
    pub fn interrupt(&self, key: impl Into<String>, after: usize) {
        self.interrupted
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), after);
    }

    pub fn clear_failures(&self) {
        self.write_failures().clear();
        self.interrupted.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn check(&self, op: StoreOp, key: &str) -> Result<()> {
        let failures = self.failures.read().unwrap_or_else(|e| e.into_inner());
        if failures.contains(&(op, None)) || failures.contains(&(op, Some(key.to_string()))) {
            debug!("memory store: injected {:?} failure for key={:?}", op, key);
            return Err(FsError::Storage(format!("injected {:?} failure: {}", op, key)));
        }
        Ok(())
    }

    fn read_objects(&self) -> RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_objects(&self) -> RwLockWriteGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }

    fn write_failures(&self) -> RwLockWriteGuard<'_, HashSet<(StoreOp, Option<String>)>> {
        self.failures.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Yields its bytes, then fails like a dropped connection.
struct Interrupted(Cursor<Vec<u8>>);

impl AsyncRead for Interrupted {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.0.position() < self.0.get_ref().len() as u64 {
            return Pin::new(&mut self.0).poll_read(cx, buf);
        }
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check(StoreOp::List, prefix)?;
        let objects = self.read_objects();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| {
                ObjectInfo::new(key.clone(), o.data.len() as u64, o.modified, format!("\"{:x}\"", o.version))
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<ObjectBody> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check(StoreOp::Get, key)?;
        let data = self
            .object(key)
            .ok_or_else(|| FsError::NotFound(key.to_string()))?;
        let size = data.len() as u64;
        let cut = self
            .interrupted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied();
        match cut {
            Some(after) => {
                debug!("memory store: body of {:?} breaks off after {} bytes", key, after);
                let prefix = data[..after.min(data.len())].to_vec();
                Ok(ObjectBody::new(size, Box::pin(Interrupted(Cursor::new(prefix)))))
            }
            None => Ok(ObjectBody::new(size, Box::pin(Cursor::new(data)))),
        }
    }

    async fn put(&self, key: &str, source: PutSource) -> Result<()> {
        self.check(StoreOp::Put, key)?;
        let data = match source {
            PutSource::Empty => Vec::new(),
            PutSource::File(path) => tokio::fs::read(&path).await?,
        };
        self.insert(key, data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(StoreOp::Delete, key)?;
        self.write_objects().remove(key);
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.check(StoreOp::Copy, source_key)?;
        let data = self
            .object(source_key)
            .ok_or_else(|| FsError::NotFound(source_key.to_string()))?;
        self.insert(dest_key, data);
        Ok(())
    }
}
