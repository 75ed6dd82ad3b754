use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use super::{copy_tree, RefCounter, StorageDriver};

/// Plain-directory driver: every layer is a full copy of its parent.
/// Slow and space hungry, but needs no kernel support.
pub struct VfsDriver {
    home: PathBuf,
    refs: RefCounter,
}

impl VfsDriver {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            refs: RefCounter::default(),
        }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }
}

impl StorageDriver for VfsDriver {
    fn name(&self) -> &str {
        "vfs"
    }

    fn create(&self, id: &str, parent: Option<&str>) -> io::Result<()> {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&self.home)?;

        let dir = self.dir(id);
        fs::DirBuilder::new().mode(0o755).create(&dir)?;

        let Some(parent) = parent else {
            return Ok(());
        };

        let copied = copy_tree(&self.dir(parent), &dir).and_then(|()| {
            let mode = fs::metadata(self.dir(parent))?.permissions();
            fs::set_permissions(&dir, mode)
        });
        if let Err(e) = copied {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, id: &str, mount_label: &str) -> io::Result<PathBuf> {
        let dir = self.dir(id);
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("vfs layer {id} does not exist"),
            ));
        }
        let count = self.refs.increment(id);
        tracing::debug!(id, mount_label, references = count, "vfs get");
        Ok(dir)
    }

    fn put(&self, id: &str) -> io::Result<()> {
        let count = self.refs.decrement(id);
        tracing::debug!(id, references = count, "vfs put");
        Ok(())
    }

    fn remove(&self, id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.dir(id)) {
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
    fn child_layer_starts_as_a_copy_of_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let driver = VfsDriver::new(dir.path().join("vfs/dir"));

        driver.create("base", None).unwrap();
        fs::write(dir.path().join("vfs/dir/base/hello"), "world").unwrap();

        driver.create("child", Some("base")).unwrap();
        let path = driver.get("child", "test").unwrap();
        assert_eq!(fs::read_to_string(path.join("hello")).unwrap(), "world");
        assert_eq!(driver.references("child"), 1);

        driver.put("child").unwrap();
        assert_eq!(driver.references("child"), 0);

        driver.remove("child").unwrap();
        assert!(!driver.exists("child"));
        assert!(driver.exists("base"));
    }

    #[test]
    fn create_fails_for_missing_parent_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let driver = VfsDriver::new(dir.path().join("vfs/dir"));
        assert!(driver.create("orphan", Some("nope")).is_err());
        assert!(!driver.exists("orphan"));
    }

    #[test]
    fn get_of_unknown_layer_takes_no_reference() {
        let dir = tempfile::tempdir().unwrap();
        let driver = VfsDriver::new(dir.path().to_path_buf());
        assert!(driver.get("ghost", "test").is_err());
        assert_eq!(driver.references("ghost"), 0);
    }
}
