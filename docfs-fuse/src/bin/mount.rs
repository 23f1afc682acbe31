use anyhow::{Context, Result};
use clap::Parser;
use docfs_core::{Overlay, OverlayConfig};
use docfs_fuse::DocFs;
use fuser::MountOption;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mount a document-backed overlay of a real directory
#[derive(Parser, Debug)]
#[command(name = "docfs-mount", version)]
struct Args {
    /// Where the overlay becomes visible
    mountpoint: PathBuf,

    /// JSON configuration file; the flags below override it
    #[arg(long, env = "DOCFS_CONFIG")]
    config: Option<PathBuf>,

    /// Real directory holding the file contents
    #[arg(long, env = "DOCFS_BACKING_DIR")]
    backing_dir: Option<PathBuf>,

    /// Directory of the metadata store
    #[arg(long, env = "DOCFS_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Only track metadata, leaving the real entries untouched on updates
    #[arg(long)]
    metadata_only: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

impl Args {
    fn overlay_config(&self) -> Result<OverlayConfig> {
        let mut config = match &self.config {
            Some(path) => OverlayConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => {
                let backing = self
                    .backing_dir
                    .clone()
                    .context("--backing-dir is required without --config")?;
                let store = self
                    .store_dir
                    .clone()
                    .context("--store-dir is required without --config")?;
                OverlayConfig::new(backing, store)
            }
        };
        if let Some(backing) = &self.backing_dir {
            config.mount_point = backing.clone();
        }
        if let Some(store) = &self.store_dir {
            config.store_dir = store.clone();
        }
        config.metadata_only |= self.metadata_only;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.overlay_config()?;
    info!(
        mountpoint = %args.mountpoint.display(),
        backing = %config.mount_point.display(),
        store = %config.store_dir.display(),
        "mounting overlay"
    );
    let overlay = Overlay::from_config(config).context("opening overlay")?;
    let populated = overlay.populate_tree("/").context("populating metadata")?;
    info!(documents = populated.len(), "metadata ready");

    let mut options = vec![MountOption::FSName("docfs".to_string())];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }
    fuser::mount2(DocFs::new(overlay), &args.mountpoint, &options).context("mount failed")?;
    Ok(())
}
