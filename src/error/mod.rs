use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FsError {
    /// POSIX error code reported to the driver host.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Unsupported(_) => libc::ENOSYS,
            FsError::Io(_) | FsError::Storage(_) => libc::EIO,
            FsError::InvalidPath(_) | FsError::Config(_) => libc::EINVAL,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
