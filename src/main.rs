//! Entry point: parses the mount command line, opens the disk image, and
//! drives the `fuser` upcall loop until the mountpoint is unmounted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use duskfs::{fs, fuse_adapter};
use fuser::MountOption;

/// A small userspace-mounted hierarchical filesystem backed by a single
/// fixed-size disk image.
#[derive(Parser, Debug)]
#[command(name = "duskfs", version, about)]
struct Cli {
    /// Path to the disk image file; created and zero-extended if absent.
    image: PathBuf,

    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Extra options forwarded to the FUSE mount (e.g. `-o allow_other`).
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let core = fs::Filesystem::open(&cli.image)
        .with_context(|| format!("failed to mount image {}", cli.image.display()))?;

    let mut mount_options = vec![MountOption::FSName("duskfs".to_string())];
    for opt in &cli.options {
        if opt == "ro" {
            mount_options.push(MountOption::RO);
        } else if opt == "allow_other" {
            mount_options.push(MountOption::AllowOther);
        }
    }

    log::info!(
        "mounting {} at {}",
        cli.image.display(),
        cli.mountpoint.display()
    );
    fuse_adapter::mount(core, &cli.mountpoint, &mount_options)
        .with_context(|| format!("failed to mount at {}", cli.mountpoint.display()))?;
    Ok(())
}
