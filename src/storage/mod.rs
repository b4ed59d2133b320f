use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use crate::error::Result;

pub mod memory;
pub mod s3;

pub use memory::{MemoryStore, StoreOp};
pub use s3::S3Store;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    /// True iff the key ends in `/`.
    pub is_dir: bool,
    pub etag: String,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64, last_modified: SystemTime, etag: impl Into<String>) -> Self {
        let key = key.into();
        let is_dir = key.ends_with('/');
        Self {
            key,
            size,
            last_modified,
            is_dir,
            etag: etag.into(),
        }
    }
}

/// A streamed object body. `size` is the number of bytes `reader` yields.
pub struct ObjectBody {
    pub size: u64,
    pub reader: BoxReader,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody").field("size", &self.size).finish()
    }
}

impl ObjectBody {
    pub fn new(size: u64, reader: BoxReader) -> Self {
        Self { size, reader }
    }

    pub fn empty() -> Self {
        Self::new(0, Box::pin(tokio::io::empty()))
    }

    /// Narrows the body to `[offset, offset + len)` by reading and dropping
    /// the first `offset` bytes. Every byte before `offset` crosses the wire.
    pub async fn slice(mut self, offset: u64, len: u64) -> Result<ObjectBody> {
        if offset >= self.size {
            return Ok(ObjectBody::empty());
        }
        if offset > 0 {
            let discarded = tokio::io::copy(&mut (&mut self.reader).take(offset), &mut tokio::io::sink()).await?;
            if discarded < offset {
                return Ok(ObjectBody::empty());
            }
        }
        let remaining = (self.size - offset).min(len);
        Ok(ObjectBody::new(remaining, Box::pin(self.reader.take(remaining))))
    }

    /// Fills `buf` from the body until it is full or the body ends.
    pub async fn read_into(mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Content handed to [`ObjectStore::put`].
#[derive(Debug, Clone)]
pub enum PutSource {
    Empty,
    File(PathBuf),
}

/// The operations consumed from an object-storage client bound to one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Recursive listing of every key under `prefix`, all pages.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn get(&self, key: &str) -> Result<ObjectBody>;
    async fn put(&self, key: &str, source: PutSource) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Server-side copy within the bucket.
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;

    /// Up to `len` bytes starting at `offset`; empty when `offset` is at or
    /// past the end of the object.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<ObjectBody> {
        self.get(key).await?.slice(offset, len).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data: &'static [u8]) -> ObjectBody {
        ObjectBody::new(data.len() as u64, Box::pin(data))
    }

    #[test]
    fn test_object_info_dir_flag() {
        let now = SystemTime::now();
        assert!(ObjectInfo::new("a/", 0, now, "").is_dir);
        assert!(!ObjectInfo::new("a/b", 3, now, "").is_dir);
    }

    #[tokio::test]
    async fn test_slice_middle() {
        let sliced = body(b"0123456789").slice(3, 4).await.unwrap();
        assert_eq!(sliced.size, 4);
        let mut buf = [0u8; 8];
        let n = sliced.read_into(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"3456");
    }

    #[tokio::test]
    async fn test_slice_past_end() {
        let sliced = body(b"abc").slice(3, 10).await.unwrap();
        assert_eq!(sliced.size, 0);
        let mut buf = [0u8; 4];
        assert_eq!(sliced.read_into(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slice_short_stream() {
        // Reported size larger than the stream actually delivers.
        let lying = ObjectBody::new(100, Box::pin(&b"abc"[..]));
        let sliced = lying.slice(10, 5).await.unwrap();
        assert_eq!(sliced.size, 0);
    }
}
