use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use super::{copy_tree, RefCounter, StorageDriver};
use crate::mount::is_mountpoint;

/// Legacy single-lower overlay layout.
///
/// - root layer: `<id>/root`
/// - any other layer: `<id>/lower-id` naming the root layer, plus `upper`,
///   `work` and `merged`. A child of a non-root layer starts with a copy of
///   its parent's `upper`.
///
/// `get` mounts `merged` on the first reference and `put` unmounts it on the
/// last. A `put` from a process that never called `get` (release after a
/// separate mount invocation) unmounts whatever is still mounted.
pub struct OverlayDriver {
    home: PathBuf,
    refs: RefCounter,
}

impl OverlayDriver {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            refs: RefCounter::default(),
        }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    fn lower_id(&self, id: &str) -> io::Result<String> {
        Ok(fs::read_to_string(self.dir(id).join("lower-id"))?.trim().to_string())
    }

    fn create_layer(&self, dir: &Path, parent: Option<&str>) -> io::Result<()> {
        let Some(parent) = parent else {
            return fs::DirBuilder::new().mode(0o755).create(dir.join("root"));
        };

        let parent_dir = self.dir(parent);
        let lower_id = if parent_dir.join("root").is_dir() {
            fs::DirBuilder::new().mode(0o755).create(dir.join("upper"))?;
            parent.to_string()
        } else {
            let lower_id = self.lower_id(parent)?;
            let upper = dir.join("upper");
            fs::DirBuilder::new().mode(0o755).create(&upper)?;
            copy_tree(&parent_dir.join("upper"), &upper)?;
            lower_id
        };

        fs::write(dir.join("lower-id"), &lower_id)?;
        fs::DirBuilder::new().mode(0o700).create(dir.join("work"))?;
        fs::DirBuilder::new().mode(0o700).create(dir.join("merged"))
    }

    fn mount_merged(&self, id: &str, merged: &Path) -> io::Result<()> {
        let dir = self.dir(id);
        let lower = self.dir(&self.lower_id(id)?).join("root");
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            dir.join("upper").display(),
            dir.join("work").display()
        );
        mount(Some("overlay"), merged, Some("overlay"), MsFlags::empty(), Some(data.as_str()))?;
        Ok(())
    }

    fn unmount_merged(&self, merged: &Path) -> io::Result<()> {
        if is_mountpoint(merged)? {
            umount2(merged, MntFlags::empty())?;
        }
        Ok(())
    }
}

impl StorageDriver for OverlayDriver {
    fn name(&self) -> &str {
        "overlay"
    }

    fn create(&self, id: &str, parent: Option<&str>) -> io::Result<()> {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&self.home)?;

        let dir = self.dir(id);
        fs::DirBuilder::new().mode(0o700).create(&dir)?;
        if let Err(e) = self.create_layer(&dir, parent) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, id: &str, mount_label: &str) -> io::Result<PathBuf> {
        let dir = self.dir(id);
        let root = dir.join("root");
        if root.is_dir() {
            self.refs.increment(id);
            return Ok(root);
        }

        let merged = dir.join("merged");
        if !merged.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("overlay layer {id} does not exist"),
            ));
        }

        let mounted = is_mountpoint(&merged)?;
        let count = self.refs.increment(id);
        if count == 1 && !mounted {
            if let Err(e) = self.mount_merged(id, &merged) {
                self.refs.decrement(id);
                return Err(e);
            }
            tracing::debug!(id, mount_label, merged = %merged.display(), "Mounted overlay");
        }
        Ok(merged)
    }

    fn put(&self, id: &str) -> io::Result<()> {
        if self.refs.decrement(id) > 0 {
            return Ok(());
        }
        let merged = self.dir(id).join("merged");
        if merged.is_dir() {
            self.unmount_merged(&merged)?;
            tracing::debug!(id, "Unmounted overlay");
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> io::Result<()> {
        let dir = self.dir(id);
        let merged = dir.join("merged");
        if merged.is_dir() {
            self.unmount_merged(&merged)?;
        }
        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).is_dir()
    }

    fn references(&self, id: &str) -> usize {
        self.refs.count(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_of_root_and_child_layers() {
        let dir = tempfile::tempdir().unwrap();
        let driver = OverlayDriver::new(dir.path().join("overlay"));

        driver.create("base", None).unwrap();
        assert!(dir.path().join("overlay/base/root").is_dir());

        driver.create("mid", Some("base")).unwrap();
        fs::write(dir.path().join("overlay/mid/upper/added"), "x").unwrap();
        assert_eq!(driver.lower_id("mid").unwrap(), "base");

        driver.create("top", Some("mid")).unwrap();
        assert_eq!(driver.lower_id("top").unwrap(), "base");
        assert!(dir.path().join("overlay/top/upper/added").is_file());
        assert!(dir.path().join("overlay/top/merged").is_dir());
    }

    #[test]
    fn root_layer_is_served_without_mounting() {
        let dir = tempfile::tempdir().unwrap();
        let driver = OverlayDriver::new(dir.path().join("overlay"));
        driver.create("base", None).unwrap();

        let path = driver.get("base", "test").unwrap();
        assert_eq!(path, dir.path().join("overlay/base/root"));
        assert_eq!(driver.references("base"), 1);
        driver.put("base").unwrap();
        assert_eq!(driver.references("base"), 0);
    }

    #[test]
    fn failed_get_holds_no_reference() {
        let dir = tempfile::tempdir().unwrap();
        let driver = OverlayDriver::new(dir.path().join("overlay"));
        driver.create("base", None).unwrap();
        driver.create("child", Some("base")).unwrap();
        fs::remove_file(dir.path().join("overlay/child/lower-id")).unwrap();

        assert!(driver.get("child", "test").is_err());
        assert_eq!(driver.references("child"), 0);
    }

    #[test]
    fn create_with_missing_parent_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let driver = OverlayDriver::new(dir.path().join("overlay"));
        assert!(driver.create("child", Some("nope")).is_err());
        assert!(!driver.exists("child"));
    }
}
