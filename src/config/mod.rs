use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::error::{FsError, Result};

const CONFIG_DIR: &str = ".bucketfs";
const CONFIG_FILE: &str = "config.json";

/// Connection and mount settings for one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub use_ssl: bool,
    pub region: String,
    pub bucket: String,
    pub mount_path: Option<PathBuf>,
    pub fs: FsOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            use_ssl: true,
            region: "us-east-1".to_string(),
            bucket: String::new(),
            mount_path: None,
            fs: FsOptions::default(),
        }
    }
}

impl AgentConfig {
    /// `~/.bucketfs/config.json`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| FsError::Config("cannot determine home directory".to_string()))?;
        Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads the file at `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let config: AgentConfig = serde_json::from_str(&data)
                    .map_err(|e| FsError::Config(format!("{:?}: {}", path, e)))?;
                debug!("loaded config from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(FsError::Io(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FsError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn has_static_credentials(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }

    /// Endpoint URL with the scheme chosen by `use_ssl`. An endpoint that
    /// already carries a scheme is used as is.
    pub fn endpoint_url(&self) -> Option<String> {
        if self.endpoint.is_empty() {
            return None;
        }
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            return Some(self.endpoint.clone());
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        Some(format!("{}://{}", scheme, self.endpoint))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(FsError::Config("bucket is not set".to_string()));
        }
        self.fs.validate()
    }
}

/// Tunables of the filesystem adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    pub list_ttl_ms: u64,
    pub capacity_ttl_ms: u64,
    /// Serve reads with ranged GETs instead of discarding the object prefix.
    pub ranged_reads: bool,
    /// Flush attempts made by `release` before giving up on a dirty handle.
    pub release_flush_attempts: u32,
    /// Keep the staging file of a handle whose final flush failed.
    pub preserve_unflushed: bool,
    pub staging_dir: Option<PathBuf>,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            list_ttl_ms: 2_000,
            capacity_ttl_ms: 30_000,
            ranged_reads: true,
            release_flush_attempts: 2,
            preserve_unflushed: true,
            staging_dir: None,
        }
    }
}

impl FsOptions {
    pub fn list_ttl(&self) -> Duration {
        Duration::from_millis(self.list_ttl_ms)
    }

    pub fn capacity_ttl(&self) -> Duration {
        Duration::from_millis(self.capacity_ttl_ms)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.release_flush_attempts == 0 {
            return Err(FsError::Config(
                "release_flush_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
