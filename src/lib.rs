pub mod error;
pub mod config;
pub mod storage;
pub mod cache;
pub mod fs;
pub mod posix;
pub mod fuse;

pub use error::{FsError, Result};
pub use config::{AgentConfig, FsOptions};
pub use storage::{MemoryStore, ObjectStore, S3Store};
pub use cache::{Capacity, ListingCache};
pub use fs::{BucketFs, PathFilesystem};
pub use fuse::FuseAdapter;
