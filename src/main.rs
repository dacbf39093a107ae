use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use drivefs::cache::WriteCache;
use drivefs::config::Config;
use drivefs::fs::DriveFs;
use drivefs::meta::MetaStore;
use drivefs::remote::{HttpRemote, Remote, RetryRemote};
use drivefs::sync::UploadQueue;

#[derive(Parser)]
#[command(name = "drivefs", about = "Mounts a remote object store as a local filesystem")]
struct Cli {
    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// Print debugging messages.
    #[arg(long)]
    debug: bool,

    /// Mount with -o allow_other.
    #[arg(long = "allow-other")]
    allow_other: bool,

    /// Directory holding drive.db, credentials.json and token.json.
    #[arg(long)]
    datadir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = Config::new(cli.mountpoint, cli.datadir)?;
    config.debug = cli.debug;
    config.allow_other = cli.allow_other;
    config.ensure_dirs()?;

    let meta = Arc::new(
        MetaStore::open(&config.db_path())
            .await
            .context("failed to open metadata store")?,
    );
    let remote: Arc<dyn Remote> = Arc::new(RetryRemote::new(
        HttpRemote::from_token_file(&config.token_path())
            .context("cannot read credentials; run the authorization flow first")?,
    ));
    let queue = UploadQueue::start(Arc::clone(&meta), Arc::clone(&remote))?;
    let cache = WriteCache::new(
        Arc::clone(&remote),
        Arc::clone(&meta),
        Arc::clone(&queue),
        config.staging_dir(),
    );

    let fs = DriveFs::new(config.clone(), meta, remote, cache, queue);
    let mut mount = fs.clone().mount().await?;

    info!(
        mount_point = %config.mount_point.display(),
        data_dir = %config.data_dir.display(),
        "drivefs mounted"
    );

    tokio::select! {
        result = &mut mount => {
            // Unmounted externally, e.g. via fusermount -u.
            if let Err(err) = fs.graceful_shutdown().await {
                error!(error = %err, "shutdown after unmount failed");
            }
            result.context("FUSE session failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, starting graceful shutdown");
            if let Err(err) = fs.graceful_shutdown().await {
                error!(error = %err, "graceful shutdown failed");
            }
            mount.unmount().await.context("failed to unmount")?;
        }
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .init();
}
