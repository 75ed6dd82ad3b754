mod cmd;
mod config;
mod progress;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dg")]
#[command(about = "Inspect, mount and export images of a Docker graph store")]
#[command(version)]
struct Cli {
    /// Root of the Docker store
    #[arg(long, global = true, env = "DG_ROOT")]
    root: Option<PathBuf>,

    /// Storage driver (overlay, vfs); detected from the store when omitted
    #[arg(long, global = true, env = "DG_DRIVER")]
    driver: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount an image's filesystem read-only and print the mount ID
    Mount {
        /// Comma-separated mount options (nodev, noexec, noatime, ...)
        #[arg(short, long, value_delimiter = ',')]
        options: Vec<String>,

        /// Image name, tag, digest or ID
        image: Option<String>,

        /// Mount point; a fresh temporary directory when omitted
        dest: Option<PathBuf>,
    },

    /// Release a mount created by `dg mount`
    Umount {
        /// Force the unmount of a busy mount point
        #[arg(short, long)]
        force: bool,

        /// Mount point or mount ID
        target: String,
    },

    /// Export an image as a runtime bundle archive
    Bundle {
        /// Image name, tag, digest or ID
        image: String,

        /// Archive to write
        bundle_file: PathBuf,
    },

    /// List images
    Images {
        /// Show intermediate images too
        #[arg(short, long)]
        all: bool,

        /// Filter output (dangling=true|false, label=<key>[=<value>])
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        /// Repository name pattern, optionally with `:tag`
        pattern: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DG_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    config::init_from_cli(cli.root, cli.driver, cli.json)?;

    match cli.command {
        Commands::Mount {
            options,
            image,
            dest,
        } => cmd::mount::run(image.as_deref(), dest, &options),
        Commands::Umount { force, target } => cmd::umount::run(&target, force),
        Commands::Bundle { image, bundle_file } => cmd::bundle::run(&image, &bundle_file),
        Commands::Images {
            all,
            filters,
            pattern,
        } => cmd::images::run(all, &filters, pattern.as_deref()),
    }
}
