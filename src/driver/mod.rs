//! Storage driver seam.
//!
//! The driver owns the on-disk layer directories; this crate only asks it
//! to allocate a layer, hand back a mountable path for it, and let go of it.

#[cfg(target_os = "linux")]
pub mod overlay;
pub mod vfs;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{GraphError, Result};

/// Operations the mount layer needs from a storage driver.
pub trait StorageDriver {
    /// Driver name as used in `repositories-<name>`.
    fn name(&self) -> &str;

    /// Allocate an empty layer `id` on top of `parent`.
    fn create(&self, id: &str, parent: Option<&str>) -> io::Result<()>;

    /// Path of the merged view of `id`; takes a reference on the layer.
    fn get(&self, id: &str, mount_label: &str) -> io::Result<PathBuf>;

    /// Drop one reference taken by [`StorageDriver::get`].
    fn put(&self, id: &str) -> io::Result<()>;

    /// Delete the layer and its directories.
    fn remove(&self, id: &str) -> io::Result<()>;

    fn exists(&self, id: &str) -> bool;

    /// References currently held on `id` by this process.
    fn references(&self, id: &str) -> usize;
}

/// Per-layer reference counts.
#[derive(Debug, Default)]
pub struct RefCounter {
    counts: Mutex<HashMap<String, usize>>,
}

impl RefCounter {
    pub fn increment(&self, id: &str) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the remaining count; never goes below zero.
    pub fn decrement(&self, id: &str) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        match counts.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            _ => {
                counts.remove(id);
                0
            }
        }
    }

    pub fn count(&self, id: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(id).copied().unwrap_or(0)
    }
}

/// Drivers this tool knows how to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriverKind {
    Overlay,
    Vfs,
}

impl StorageDriverKind {
    pub const ALL: [StorageDriverKind; 2] = [StorageDriverKind::Overlay, StorageDriverKind::Vfs];

    /// Name of the repositories file this driver's store keeps under root.
    pub fn repositories_file(self) -> String {
        format!("repositories-{self}")
    }
}

impl fmt::Display for StorageDriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageDriverKind::Overlay => write!(f, "overlay"),
            StorageDriverKind::Vfs => write!(f, "vfs"),
        }
    }
}

impl FromStr for StorageDriverKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "overlay" => Ok(StorageDriverKind::Overlay),
            "vfs" => Ok(StorageDriverKind::Vfs),
            other => Err(GraphError::UnsupportedDriver(other.to_string())),
        }
    }
}

/// Pick the driver whose repositories file exists under `root`.
pub fn detect(root: &Path) -> Option<StorageDriverKind> {
    StorageDriverKind::ALL
        .into_iter()
        .find(|kind| root.join(kind.repositories_file()).is_file())
}

/// Open the driver rooted at the store's standard location for `kind`.
pub fn open(kind: StorageDriverKind, root: &Path) -> Result<Box<dyn StorageDriver>> {
    match kind {
        #[cfg(target_os = "linux")]
        StorageDriverKind::Overlay => Ok(Box::new(overlay::OverlayDriver::new(root.join("overlay")))),
        #[cfg(not(target_os = "linux"))]
        StorageDriverKind::Overlay => Err(GraphError::UnsupportedDriver(
            "overlay (Linux only)".to_string(),
        )),
        StorageDriverKind::Vfs => Ok(Box::new(vfs::VfsDriver::new(root.join("vfs").join("dir")))),
    }
}

/// Recursively copy `src` into the existing directory `dst`.
///
/// Keeps permissions, symlink targets and modification times. Ownership is
/// kept when the process is allowed to change it. FIFOs are recreated, device
/// nodes too when the process may create them. Sockets are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(src)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            fs::create_dir(&to)?;
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        } else if !make_special(&meta, &to)? {
            tracing::debug!(path = %from.display(), "Skipping special file");
            continue;
        }

        copy_attributes(&meta, &to)?;
    }

    Ok(())
}

/// Recreate a FIFO or device node; `false` when it was not created.
fn make_special(meta: &fs::Metadata, to: &Path) -> io::Result<bool> {
    use nix::sys::stat::{mknod, Mode, SFlag};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let file_type = meta.file_type();
    let perm = Mode::from_bits_truncate(meta.mode() as _);
    if file_type.is_fifo() {
        nix::unistd::mkfifo(to, perm)?;
        return Ok(true);
    }

    let kind = if file_type.is_char_device() {
        SFlag::S_IFCHR
    } else if file_type.is_block_device() {
        SFlag::S_IFBLK
    } else {
        return Ok(false);
    };
    match mknod(to, kind, perm, meta.rdev() as _) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EPERM) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn copy_attributes(meta: &fs::Metadata, to: &Path) -> io::Result<()> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;
    use std::os::unix::fs::MetadataExt;

    match std::os::unix::fs::lchown(to, Some(meta.uid()), Some(meta.gid())) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
        Err(e) => return Err(e),
    }

    if meta.file_type().is_symlink() {
        return Ok(());
    }

    fs::set_permissions(to, fs::Permissions::from_mode(meta.permissions().mode()))?;
    // Set by path; opening a FIFO would block
    utimensat(
        None,
        to,
        &TimeSpec::new(meta.atime(), meta.atime_nsec()),
        &TimeSpec::new(meta.mtime(), meta.mtime_nsec()),
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}
