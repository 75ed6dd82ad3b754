use std::path::PathBuf;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};
use graphtool::mount::{MountOptions, SysMounter};

use super::{print_store_summary, Store};
use crate::config;

pub fn run(image: Option<&str>, dest: Option<PathBuf>, options: &[String]) -> Result<()> {
    let cfg = config::get();
    let Some(image) = image else {
        anyhow::bail!("An image is required: dg mount [-o <options>] <image> [<dest>]");
    };
    let options = MountOptions::parse(options)?;

    print_store_summary(cfg);
    let store = Store::open(cfg)?;
    let image_id = store.resolve(image)?;

    let mounter = SysMounter;
    let mounts = store.mounts(&mounter);
    let record = match dest {
        Some(dest) => mounts.create(&image_id, &dest, &options),
        None => mounts.create_in_temp_dir(&image_id, &options),
    }
    .with_context(|| format!("Failed to mount {image}"))?;

    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        eprintln!(
            "{} Mounted {} at {}",
            "✔".green(),
            style::style(image).bold(),
            style::style(record.destination.display()).cyan()
        );
        println!("{}", record.mount_id);
    }
    Ok(())
}
