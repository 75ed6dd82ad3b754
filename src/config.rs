use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use graphtool::driver::{self, StorageDriverKind};

/// Store root used when neither `--root` nor `DG_ROOT` is given.
pub const DEFAULT_ROOT: &str = "/var/lib/docker";

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Settings shared by every command of one invocation.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub root: PathBuf,
    pub driver: StorageDriverKind,
    pub json: bool,
}

impl AppConfig {
    pub fn graph_dir(&self) -> PathBuf {
        self.root.join("graph")
    }

    pub fn repositories_file(&self) -> PathBuf {
        self.root.join(self.driver.repositories_file())
    }

    /// Where live mount records are kept between invocations.
    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join("graphtool").join("mounts")
    }
}

/// Build the config from already-merged CLI/environment values.
///
/// Without an explicit driver, the first driver with a repositories file
/// under the root wins.
pub fn init_from_cli(root: Option<PathBuf>, driver: Option<String>, json: bool) -> Result<()> {
    let root = root.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
    let driver = match driver {
        Some(name) => name
            .parse::<StorageDriverKind>()
            .with_context(|| format!("Invalid --driver '{name}'"))?,
        None => detect_driver(&root)?,
    };

    tracing::debug!(root = %root.display(), %driver, "Configuration resolved");
    let _ = CONFIG.set(AppConfig { root, driver, json });
    Ok(())
}

/// The config set by [`init_from_cli`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("config not initialized")
}

fn detect_driver(root: &Path) -> Result<StorageDriverKind> {
    driver::detect(root).with_context(|| {
        format!(
            "No repositories file for a supported driver ({}) under {}. Pass --driver or --root.",
            StorageDriverKind::ALL.map(|k| k.to_string()).join(", "),
            root.display()
        )
    })
}
