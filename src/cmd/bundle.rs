use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};
use graphtool::bundle::BundleExporter;
use graphtool::cancel;
use graphtool::mount::SysMounter;

use super::{format_bytes, print_store_summary, Store};
use crate::config;
use crate::progress::Spinner;

pub fn run(image: &str, bundle_file: &Path) -> Result<()> {
    let cfg = config::get();
    print_store_summary(cfg);

    let store = Store::open(cfg)?;
    let image_id = store.resolve(image)?;
    let cancel = cancel::on_sigint()?;

    let mounter = SysMounter;
    let mounts = store.mounts(&mounter);

    let spinner = Spinner::new(format!("Archiving {}", image_id.short()));
    let bar = spinner.clone_bar();
    let mut exporter = BundleExporter::new(&mounts)
        .with_cancel(cancel)
        .on_entry(Box::new(move |_| bar.inc(1)));

    let report = match exporter.export(&image_id, bundle_file) {
        Ok(report) => report,
        Err(e) => {
            spinner.abandon();
            return Err(e).with_context(|| format!("Failed to export {image}"));
        }
    };

    spinner.finish(format!(
        "Wrote {} ({} entries, {})",
        style::style(bundle_file.display()).cyan(),
        report.entries,
        format_bytes(report.bytes_copied)
    ));

    if cfg.json {
        println!("{}", serde_json::json!({
            "Image": image_id,
            "Bundle": bundle_file,
            "Entries": report.entries,
            "BytesCopied": report.bytes_copied,
        }));
    } else {
        println!("{} bytes copied", report.bytes_copied);
    }
    Ok(())
}
