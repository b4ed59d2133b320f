use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context};
use bucketfs::{AgentConfig, BucketFs, FuseAdapter, MemoryStore, ObjectStore, S3Store};
use clap::Parser;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount an object-storage bucket as a local drive", long_about = None)]
struct Args {
    /// Config file, defaults to ~/.bucketfs/config.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mount point
    #[arg(short, long)]
    mount: Option<PathBuf>,

    #[arg(short, long)]
    bucket: Option<String>,

    /// Storage endpoint, host[:port] or a full URL
    #[arg(short, long)]
    endpoint: Option<String>,

    #[arg(long)]
    access_key: Option<String>,

    #[arg(long)]
    secret_key: Option<String>,

    #[arg(long)]
    region: Option<String>,

    /// Talk plain http to the endpoint
    #[arg(long)]
    no_ssl: bool,

    /// Directory for write staging files
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Serve an empty in-memory bucket instead of connecting to a store
    #[arg(long)]
    memory: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(mount) = self.mount {
            config.mount_path = Some(mount);
        }
        if let Some(bucket) = self.bucket {
            config.bucket = bucket;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(key) = self.access_key {
            config.access_key_id = key;
        }
        if let Some(secret) = self.secret_key {
            config.secret_access_key = secret;
        }
        if let Some(region) = self.region {
            config.region = region;
        }
        if self.no_ssl {
            config.use_ssl = false;
        }
        if let Some(dir) = self.staging_dir {
            config.fs.staging_dir = Some(dir);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(false)
        .init();
}

fn prepare_mount_point(mount_point: &Path) -> anyhow::Result<()> {
    if !mount_point.exists() {
        info!("Creating mount point {:?}", mount_point);
        std::fs::create_dir_all(mount_point)
            .with_context(|| format!("cannot create mount point {:?}", mount_point))?;
    }
    let metadata = std::fs::metadata(mount_point)
        .with_context(|| format!("cannot stat mount point {:?}", mount_point))?;
    if !metadata.is_dir() {
        bail!("mount point {:?} is not a directory", mount_point);
    }
    let mode = metadata.mode();
    if (mode & 0o400) == 0 || (mode & 0o200) == 0 {
        bail!("insufficient permissions on mount point {:?}", mount_point);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => AgentConfig::default_path()?,
    };
    let mut config = AgentConfig::load(&config_path)?;
    let memory = args.memory;
    if memory && args.bucket.is_none() && config.bucket.is_empty() {
        config.bucket = "memory".to_string();
    }
    args.apply(&mut config);
    config.validate()?;

    let Some(mount_point) = config.mount_path.clone() else {
        bail!("no mount point given; pass --mount or set mount_path in {:?}", config_path);
    };
    prepare_mount_point(&mount_point)?;

    let staging_dir = config.fs.staging_dir();
    std::fs::create_dir_all(&staging_dir)
        .with_context(|| format!("cannot create staging directory {:?}", staging_dir))?;

    let store: Arc<dyn ObjectStore> = if memory {
        warn!("Serving an in-memory bucket; nothing is persisted");
        Arc::new(MemoryStore::new())
    } else {
        info!(
            "Connecting to bucket {:?} at {}",
            config.bucket,
            config.endpoint_url().unwrap_or_else(|| "the default endpoint".to_string())
        );
        Arc::new(S3Store::connect(&config).await)
    };

    let fs = Arc::new(BucketFs::new(store, config.fs.clone()));
    let adapter = FuseAdapter::new(fs.clone(), Handle::current());
    let fs_name = format!("bucketfs:{}", config.bucket);
    let session = adapter
        .spawn(&mount_point, &fs_name)
        .with_context(|| format!("failed to mount {:?}", mount_point))?;
    info!("Mounted {} at {:?}, staging in {:?}", fs_name, mount_point, staging_dir);

    info!("Waiting for Ctrl-C...");
    if let Err(e) = signal::ctrl_c().await {
        error!("cannot listen for Ctrl-C: {}", e);
    }
    info!("Unmounting {:?}", mount_point);

    // Joining unmounts; the session thread still needs the runtime to finish
    // in-flight callbacks, so it must not block a runtime worker.
    tokio::task::spawn_blocking(move || session.join())
        .await
        .context("unmount task failed")?;

    if fs.open_handles() > 0 {
        warn!("{} handles were still open at unmount", fs.open_handles());
    }
    info!("{}", fs.cache_stats());
    Ok(())
}
