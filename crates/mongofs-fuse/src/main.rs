//! mongomount - Mount a document store as a FUSE filesystem.
//!
//! Usage: mongomount <mountpoint> [--uri <mongodb://...> | --seed <file.json>] [--expire-secs N]

// Use mimalloc as the global allocator for better performance.
// Disable with `--no-default-features` if debugging allocator issues.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use mongofs_core::{FsConfig, MongoFs};
use mongofs_fuse::{MongoFuse, StoreSource, mount_options, open_store};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mongomount")]
#[command(about = "Mount a document store as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// MongoDB connection string to serve instead of an in-memory store
    #[cfg(feature = "mongodb")]
    #[arg(short, long, env = "MONGOFS_URI", conflicts_with = "seed")]
    uri: Option<String>,

    /// JSON file to seed the in-memory store with: {"<db>": {"<coll>": [docs]}}
    #[arg(short, long)]
    seed: Option<PathBuf>,

    /// Seconds cached attributes stay valid (0 disables caching)
    #[arg(short, long, env = "MONGOFS_EXPIRE_SECS", default_value_t = 1)]
    expire_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if !cli.mount.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mount.display());
    }

    let store = open_store(cli.source())?;

    // SAFETY: getuid/getgid have no preconditions.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let config = FsConfig::default()
        .attr_ttl(Duration::from_secs(cli.expire_secs))
        .owner(uid, gid)
        .read_only(cli.read_only);

    info!(
        mount = %cli.mount.display(),
        expire_secs = cli.expire_secs,
        read_only = cli.read_only,
        "Mounting document store"
    );

    let fs = MongoFuse::new(MongoFs::new(store, config));
    mount_and_wait(&cli, fs)
}

impl Cli {
    fn source(&self) -> StoreSource<'_> {
        #[cfg(feature = "mongodb")]
        if let Some(uri) = self.uri.as_deref() {
            return StoreSource::Uri(uri);
        }
        StoreSource::Memory(self.seed.as_deref())
    }

    /// Name shown in the mount table.
    fn fsname(&self) -> String {
        match self.source() {
            #[cfg(feature = "mongodb")]
            StoreSource::Uri(_) => "mongodb".to_string(),
            StoreSource::Memory(seed) => seed
                .and_then(|p| p.file_stem())
                .map_or_else(|| "memory".to_string(), |n| n.to_string_lossy().to_string()),
        }
    }
}

/// Mount the filesystem and wait for Ctrl+C.
fn mount_and_wait(cli: &Cli, fs: MongoFuse) -> Result<()> {
    let fsname = cli.fsname();
    let options = mount_options(&fsname, cli.read_only);

    // Set up channel for signal handling
    let (tx, rx) = mpsc::channel::<()>();

    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounting filesystem (press Ctrl+C to unmount)");

    let session = fuser::spawn_mount2(fs, &cli.mount, &options).map_err(|e| {
        error!(error = %e, "Mount failed");
        anyhow::anyhow!("Failed to mount filesystem: {}", e)
    })?;

    info!("Filesystem mounted at {}", cli.mount.display());

    match rx.recv() {
        Ok(()) => {
            info!("Received interrupt signal, unmounting...");
        }
        Err(_) => {
            warn!("Signal channel closed unexpectedly");
        }
    }

    drop(session);
    info!("Filesystem unmounted");
    Ok(())
}
