pub mod bundle;
pub mod images;
pub mod mount;
pub mod umount;

use std::io::{self, Write};

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};
use graphtool::driver::{self, StorageDriver};
use graphtool::graph::reference::ReferenceStore;
use graphtool::graph::{ImageGraph, ImageId};
use graphtool::mount::{MountManager, Mounter};

use crate::config::AppConfig;

/// Everything loaded from the store root for one command.
pub struct Store {
    pub graph: ImageGraph,
    pub references: ReferenceStore,
    pub driver: Box<dyn StorageDriver>,
    cfg: &'static AppConfig,
}

impl Store {
    pub fn open(cfg: &'static AppConfig) -> Result<Self> {
        let graph = ImageGraph::open(&cfg.graph_dir())
            .with_context(|| format!("Failed to read graph under {}", cfg.root.display()))?;
        let references = ReferenceStore::load(&cfg.repositories_file()).with_context(|| {
            format!("Failed to read {}", cfg.repositories_file().display())
        })?;
        let driver = driver::open(cfg.driver, &cfg.root)?;

        tracing::debug!(images = graph.len(), driver = driver.name(), "Store opened");
        Ok(Self {
            graph,
            references,
            driver,
            cfg,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<ImageId> {
        Ok(self.references.resolve(name, &self.graph)?)
    }

    pub fn mounts<'a>(&'a self, mounter: &'a dyn Mounter) -> MountManager<'a> {
        MountManager::new(&self.graph, self.driver.as_ref(), mounter, self.cfg.mounts_dir())
    }
}

/// One dim status line on stderr naming the store in use.
pub fn print_store_summary(cfg: &AppConfig) {
    if cfg.json {
        return;
    }
    let _ = writeln!(
        io::stderr(),
        "{} {} (driver: {})",
        "Store".dim(),
        style::style(cfg.root.display()).dim(),
        style::style(cfg.driver).dim(),
    );
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return if size.fract() < 0.05 {
                format!("{:.0} {unit}", size)
            } else {
                format!("{:.1} {unit}", size)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}
