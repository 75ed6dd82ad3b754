use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};
use graphtool::mount::SysMounter;

use super::Store;
use crate::config;

pub fn run(target: &str, force: bool) -> Result<()> {
    let cfg = config::get();
    let store = Store::open(cfg)?;
    let mounter = SysMounter;
    let mounts = store.mounts(&mounter);

    let record = mounts.find(target)?;
    mounts
        .release(&record, force)
        .with_context(|| format!("Failed to release mount {}", record.mount_id))?;

    if !cfg.json {
        eprintln!(
            "{} Unmounted {}",
            "✔".green(),
            style::style(record.destination.display()).cyan()
        );
    }
    Ok(())
}
