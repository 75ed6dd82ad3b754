//! Ephemeral read-only mounts of an image's merged filesystem.
//!
//! A mount allocates a throwaway child layer on top of the image, asks the
//! driver for its merged path and bind-mounts that path onto the
//! destination. The layer is never registered in the graph. Until it is
//! released, a [`MountRecord`] is kept under the state directory so that a
//! later invocation can find and release it.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::driver::StorageDriver;
use crate::error::{GraphError, Result};
use crate::graph::{ImageGraph, ImageId};

/// Label handed to the driver for layers mounted by this tool.
pub const MOUNT_LABEL: &str = "graphtool";

/// Flags understood on `--options`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MountOption {
    ReadOnly,
    NoSuid,
    NoDev,
    NoExec,
    NoAtime,
    NoDirAtime,
    RelAtime,
    StrictAtime,
}

impl MountOption {
    fn as_str(self) -> &'static str {
        match self {
            MountOption::ReadOnly => "ro",
            MountOption::NoSuid => "nosuid",
            MountOption::NoDev => "nodev",
            MountOption::NoExec => "noexec",
            MountOption::NoAtime => "noatime",
            MountOption::NoDirAtime => "nodiratime",
            MountOption::RelAtime => "relatime",
            MountOption::StrictAtime => "strictatime",
        }
    }
}

impl FromStr for MountOption {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ro" => MountOption::ReadOnly,
            "nosuid" => MountOption::NoSuid,
            "nodev" => MountOption::NoDev,
            "noexec" => MountOption::NoExec,
            "noatime" => MountOption::NoAtime,
            "nodiratime" => MountOption::NoDirAtime,
            "relatime" => MountOption::RelAtime,
            "strictatime" => MountOption::StrictAtime,
            other => return Err(GraphError::InvalidMountOption(other.to_string())),
        })
    }
}

/// Set of mount options. `ro` and `nosuid` are always part of a mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions(BTreeSet<MountOption>);

impl MountOptions {
    /// Parse option words; empty words are ignored.
    pub fn parse<S: AsRef<str>>(options: &[S]) -> Result<Self> {
        options
            .iter()
            .map(|o| o.as_ref().trim())
            .filter(|o| !o.is_empty())
            .map(str::parse)
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }

    /// Caller options plus the read-only and nosuid flags.
    pub fn enforced(mut self) -> Self {
        self.0.insert(MountOption::ReadOnly);
        self.0.insert(MountOption::NoSuid);
        self
    }

    pub fn contains(&self, option: MountOption) -> bool {
        self.0.contains(&option)
    }

    pub fn iter(&self) -> impl Iterator<Item = MountOption> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<&str> = self.iter().map(MountOption::as_str).collect();
        f.write_str(&words.join(","))
    }
}

/// OS mount operations.
pub trait Mounter {
    /// Bind `source` onto `target` with `options` applied.
    fn bind(&self, source: &Path, target: &Path, options: &MountOptions) -> io::Result<()>;

    /// Detach `target`; `force` also applies to busy mounts.
    fn unmount(&self, target: &Path, force: bool) -> io::Result<()>;
}

/// `mount(2)`/`umount2(2)` backed mounter.
pub struct SysMounter;

#[cfg(target_os = "linux")]
impl Mounter for SysMounter {
    fn bind(&self, source: &Path, target: &Path, options: &MountOptions) -> io::Result<()> {
        use nix::mount::{mount, umount2, MntFlags, MsFlags};

        mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)?;

        // Bind mounts ignore flags on creation; they only stick on remount
        let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT;
        for option in options.iter() {
            flags |= match option {
                MountOption::ReadOnly => MsFlags::MS_RDONLY,
                MountOption::NoSuid => MsFlags::MS_NOSUID,
                MountOption::NoDev => MsFlags::MS_NODEV,
                MountOption::NoExec => MsFlags::MS_NOEXEC,
                MountOption::NoAtime => MsFlags::MS_NOATIME,
                MountOption::NoDirAtime => MsFlags::MS_NODIRATIME,
                MountOption::RelAtime => MsFlags::MS_RELATIME,
                MountOption::StrictAtime => MsFlags::MS_STRICTATIME,
            };
        }

        if let Err(e) = mount(None::<&str>, target, None::<&str>, flags, None::<&str>) {
            return Err(undo_bind(target, e.into(), |t| {
                umount2(t, MntFlags::MNT_DETACH).map_err(io::Error::from)
            }));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::mount::{umount2, MntFlags};

        let flags = if force {
            MntFlags::MNT_FORCE | MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };

        match umount2(target, flags) {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL) if !is_mountpoint(target)? => {
                tracing::warn!(target = %target.display(), "Not mounted, nothing to unmount");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SysMounter {
    fn bind(&self, _source: &Path, _target: &Path, _options: &MountOptions) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "bind mounts need Linux"))
    }

    fn unmount(&self, _target: &Path, _force: bool) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "bind mounts need Linux"))
    }
}

/// Detach a bind whose read-only remount failed.
///
/// Returns the error to report. When the detach fails too, the writable
/// bind is still in place and the error says so.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn undo_bind(
    target: &Path,
    remount_err: io::Error,
    detach: impl FnOnce(&Path) -> io::Result<()>,
) -> io::Error {
    match detach(target) {
        Ok(()) => remount_err,
        Err(detach_err) => {
            tracing::warn!(
                target = %target.display(),
                error = %detach_err,
                "Couldn't detach bind mount after failed remount"
            );
            io::Error::new(
                remount_err.kind(),
                format!(
                    "{remount_err}; writable bind left at {}: {detach_err}",
                    target.display()
                ),
            )
        }
    }
}

/// Whether `path` is currently a mount point, per `/proc/self/mountinfo`.
pub fn is_mountpoint(path: &Path) -> io::Result<bool> {
    let path = match path.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| Path::new(&unescape_mountinfo(mount_point)) == path))
}

/// Undo the octal escaping (`\040` for space) used in mountinfo paths.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(b) = u8::from_str_radix(digits, 8) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A live mount of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Id of the throwaway layer backing the mount
    pub mount_id: String,
    pub source_image_id: ImageId,
    pub destination: PathBuf,
    /// Driver that owns the throwaway layer
    pub driver: String,
    pub options: String,
    /// The destination was created for this mount and goes away with it
    #[serde(default)]
    pub owns_destination: bool,
}

/// Creates and releases mounts for one graph/driver pair.
pub struct MountManager<'a> {
    graph: &'a ImageGraph,
    driver: &'a dyn StorageDriver,
    mounter: &'a dyn Mounter,
    state_dir: PathBuf,
}

impl<'a> MountManager<'a> {
    /// `state_dir` holds one JSON record per live mount.
    pub fn new(
        graph: &'a ImageGraph,
        driver: &'a dyn StorageDriver,
        mounter: &'a dyn Mounter,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            graph,
            driver,
            mounter,
            state_dir,
        }
    }

    pub fn driver(&self) -> &dyn StorageDriver {
        self.driver
    }

    /// Mount `image_id` read-only at `destination`.
    ///
    /// Nothing is allocated unless the image exists. Any failure after the
    /// layer is allocated releases it again before returning.
    pub fn create(
        &self,
        image_id: &ImageId,
        destination: &Path,
        options: &MountOptions,
    ) -> Result<MountRecord> {
        self.mount_at(image_id, destination, options, false)
    }

    /// Mount `image_id` on a fresh `dg-mount*` directory in the system temp
    /// dir. The directory is removed when the mount is released, or right
    /// away if mounting fails.
    pub fn create_in_temp_dir(
        &self,
        image_id: &ImageId,
        options: &MountOptions,
    ) -> Result<MountRecord> {
        if !self.graph.contains(image_id.as_str()) {
            return Err(GraphError::ReferenceNotFound(image_id.to_string()));
        }
        let dir = tempfile::Builder::new().prefix("dg-mount").tempdir()?.keep();
        self.mount_at(image_id, &dir, options, true).inspect_err(|_| {
            // A bind whose rollback failed may still sit on it; never recurse
            match fs::remove_dir(&dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    tracing::warn!(path = %dir.display(), error = %e, "Leaving mount directory behind");
                }
                _ => {}
            }
        })
    }

    fn mount_at(
        &self,
        image_id: &ImageId,
        destination: &Path,
        options: &MountOptions,
        owns_destination: bool,
    ) -> Result<MountRecord> {
        if !self.graph.contains(image_id.as_str()) {
            return Err(GraphError::ReferenceNotFound(image_id.to_string()));
        }

        let destination = destination
            .canonicalize()
            .map_err(|e| GraphError::MountFailed {
                destination: destination.to_path_buf(),
                message: e.to_string(),
            })?;

        let mount_id = new_layer_id(image_id);
        self.driver
            .create(&mount_id, Some(image_id.as_str()))
            .map_err(|e| GraphError::AllocationFailed {
                id: mount_id.clone(),
                message: e.to_string(),
            })?;

        let path = match self.driver.get(&mount_id, MOUNT_LABEL) {
            Ok(path) => path,
            Err(e) => {
                self.discard_layer(&mount_id);
                return Err(GraphError::AllocationFailed {
                    id: mount_id,
                    message: e.to_string(),
                });
            }
        };

        let options = options.clone().enforced();
        if let Err(e) = self.mounter.bind(&path, &destination, &options) {
            self.put_layer(&mount_id);
            self.discard_layer(&mount_id);
            return Err(GraphError::MountFailed {
                destination,
                message: e.to_string(),
            });
        }

        let record = MountRecord {
            mount_id,
            source_image_id: image_id.clone(),
            destination,
            driver: self.driver.name().to_string(),
            options: options.to_string(),
            owns_destination,
        };

        if let Err(e) = self.save_record(&record) {
            if let Err(release_err) = self.release(&record, false) {
                tracing::warn!(error = %release_err, "Failed to roll back mount");
            }
            return Err(e);
        }

        tracing::info!(
            image = %record.source_image_id,
            mount_id = %record.mount_id,
            dest = %record.destination.display(),
            options = %record.options,
            "Mounted image"
        );
        Ok(record)
    }

    /// Like [`MountManager::create`], released when the guard goes away.
    pub fn mount_scoped(
        &self,
        image_id: &ImageId,
        destination: &Path,
        options: &MountOptions,
    ) -> Result<MountGuard<'_, 'a>> {
        let record = self.create(image_id, destination, options)?;
        Ok(MountGuard {
            manager: self,
            record: Some(record),
        })
    }

    /// Unmount and give the layer back to the driver.
    ///
    /// The driver reference and the layer are released even when the
    /// unmount fails; the first error is returned.
    pub fn release(&self, record: &MountRecord, force: bool) -> Result<()> {
        let unmounted = self
            .mounter
            .unmount(&record.destination, force)
            .map_err(|e| GraphError::UnmountFailed {
                target: record.destination.clone(),
                message: e.to_string(),
            });
        if let Err(e) = &unmounted {
            tracing::warn!(error = %e, mount_id = %record.mount_id, "Unmount failed, releasing layer anyway");
        }

        let put = self.driver.put(&record.mount_id);
        let removed = self.driver.remove(&record.mount_id);
        let forgotten = self.forget_record(record);

        // Only an empty, unmounted directory is removed
        let dest_removed = match (&unmounted, record.owns_destination) {
            (Ok(()), true) => match fs::remove_dir(&record.destination) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(GraphError::from(e)),
                _ => Ok(()),
            },
            _ => Ok(()),
        };

        unmounted?;
        put?;
        removed?;
        forgotten?;
        dest_removed?;

        tracing::info!(
            mount_id = %record.mount_id,
            dest = %record.destination.display(),
            "Released mount"
        );
        Ok(())
    }

    /// Find a live mount by destination path or mount id.
    pub fn find(&self, target: &str) -> Result<MountRecord> {
        let canonical = Path::new(target).canonicalize().ok();

        for record in self.records()? {
            if record.mount_id == target
                || record.destination == Path::new(target)
                || canonical.as_deref() == Some(record.destination.as_path())
            {
                return Ok(record);
            }
        }

        Err(GraphError::ReferenceNotFound(format!("no mount at {target}")))
    }

    /// Every persisted mount record; unreadable ones are logged and skipped.
    pub fn records(&self) -> Result<Vec<MountRecord>> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(GraphError::from)
                .and_then(|data| Ok(serde_json::from_slice::<MountRecord>(&data)?))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Couldn't read mount record");
                }
            }
        }
        records.sort_by(|a, b| a.mount_id.cmp(&b.mount_id));
        Ok(records)
    }

    fn record_path(&self, mount_id: &str) -> PathBuf {
        self.state_dir.join(format!("{mount_id}.json"))
    }

    fn save_record(&self, record: &MountRecord) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        let data = serde_json::to_vec_pretty(record)?;
        fs::write(self.record_path(&record.mount_id), data)?;
        Ok(())
    }

    fn forget_record(&self, record: &MountRecord) -> Result<()> {
        match fs::remove_file(self.record_path(&record.mount_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn put_layer(&self, mount_id: &str) {
        if let Err(e) = self.driver.put(mount_id) {
            tracing::warn!(mount_id, error = %e, "Failed to release layer reference");
        }
    }

    fn discard_layer(&self, mount_id: &str) {
        if let Err(e) = self.driver.remove(mount_id) {
            tracing::warn!(mount_id, error = %e, "Failed to remove throwaway layer");
        }
    }
}

/// Scoped mount; releases on drop unless released explicitly.
pub struct MountGuard<'m, 'a> {
    manager: &'m MountManager<'a>,
    record: Option<MountRecord>,
}

impl MountGuard<'_, '_> {
    pub fn path(&self) -> &Path {
        self.record
            .as_ref()
            .map(|r| r.destination.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn record(&self) -> Option<&MountRecord> {
        self.record.as_ref()
    }

    /// Release now and report the outcome.
    pub fn release(mut self) -> Result<()> {
        match self.record.take() {
            Some(record) => self.manager.release(&record, false),
            None => Ok(()),
        }
    }
}

impl Drop for MountGuard<'_, '_> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            if let Err(e) = self.manager.release(&record, false) {
                tracing::warn!(mount_id = %record.mount_id, error = %e, "Failed to release mount");
            }
        }
    }
}

/// Fresh 64-hex id for a throwaway layer on top of `parent`.
fn new_layer_id(parent: &ImageId) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(parent.as_str().as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::vfs::VfsDriver;
    use crate::graph::ImageNode;
    use chrono::Utc;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingMounter {
        mounted: RefCell<BTreeSet<PathBuf>>,
        last_options: RefCell<Option<MountOptions>>,
        attempted: RefCell<Vec<PathBuf>>,
        fail_bind: bool,
        fail_unmount: bool,
    }

    impl Mounter for RecordingMounter {
        fn bind(&self, source: &Path, target: &Path, options: &MountOptions) -> io::Result<()> {
            self.attempted.borrow_mut().push(target.to_path_buf());
            if self.fail_bind {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "EPERM"));
            }
            assert!(source.is_dir());
            self.mounted.borrow_mut().insert(target.to_path_buf());
            *self.last_options.borrow_mut() = Some(options.clone());
            Ok(())
        }

        fn unmount(&self, target: &Path, _force: bool) -> io::Result<()> {
            if self.fail_unmount {
                return Err(io::Error::new(io::ErrorKind::ResourceBusy, "EBUSY"));
            }
            self.mounted.borrow_mut().remove(target);
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        graph: ImageGraph,
        driver: VfsDriver,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let driver = VfsDriver::new(dir.path().join("vfs/dir"));
            driver.create("sha256:abc", None).unwrap();
            fs::write(dir.path().join("vfs/dir/sha256:abc/etc-release"), "v1").unwrap();
            fs::create_dir(dir.path().join("dest")).unwrap();
            let graph = ImageGraph::from_nodes([ImageNode::new("sha256:abc", None, Utc::now())]);
            Self { dir, graph, driver }
        }

        fn manager<'a>(&'a self, mounter: &'a dyn Mounter) -> MountManager<'a> {
            MountManager::new(&self.graph, &self.driver, mounter, self.dir.path().join("mounts"))
        }

        fn dest(&self) -> PathBuf {
            self.dir.path().join("dest").canonicalize().unwrap()
        }

        fn layers(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.dir.path().join("vfs/dir"))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            names
        }
    }

    #[test]
    fn create_then_release_leaves_no_trace() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);
        let image: ImageId = "sha256:abc".into();

        let record = manager.create(&image, &fx.dest(), &MountOptions::default()).unwrap();
        assert_eq!(record.mount_id.len(), 64);
        assert_eq!(record.destination, fx.dest());
        assert_eq!(fx.driver.references(&record.mount_id), 1);
        assert!(mounter.mounted.borrow().contains(&fx.dest()));
        assert_eq!(manager.records().unwrap(), vec![record.clone()]);

        manager.release(&record, false).unwrap();
        assert_eq!(fx.driver.references(&record.mount_id), 0);
        assert!(mounter.mounted.borrow().is_empty());
        assert!(manager.records().unwrap().is_empty());
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
    }

    #[test]
    fn mounts_are_always_read_only_and_nosuid() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);
        let options = MountOptions::parse(&["nodev", "", "noexec"]).unwrap();

        let record = manager.create(&"sha256:abc".into(), &fx.dest(), &options).unwrap();
        let applied = mounter.last_options.borrow().clone().unwrap();
        assert!(applied.contains(MountOption::ReadOnly));
        assert!(applied.contains(MountOption::NoSuid));
        assert!(applied.contains(MountOption::NoDev));
        assert_eq!(record.options, "ro,nosuid,nodev,noexec");
        manager.release(&record, false).unwrap();
    }

    #[test]
    fn unknown_image_allocates_nothing() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);

        let err = manager
            .create(&"sha256:missing".into(), &fx.dest(), &MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::ReferenceNotFound(_)));
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
        assert!(mounter.mounted.borrow().is_empty());
    }

    #[test]
    fn failed_bind_releases_the_throwaway_layer() {
        let fx = Fixture::new();
        let mounter = RecordingMounter {
            fail_bind: true,
            ..Default::default()
        };
        let manager = fx.manager(&mounter);

        let err = manager
            .create(&"sha256:abc".into(), &fx.dest(), &MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::MountFailed { .. }));
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
        assert!(manager.records().unwrap().is_empty());
    }

    #[test]
    fn failed_unmount_still_releases_the_layer() {
        let fx = Fixture::new();
        let ok = RecordingMounter::default();
        let record = fx
            .manager(&ok)
            .create(&"sha256:abc".into(), &fx.dest(), &MountOptions::default())
            .unwrap();

        let busy = RecordingMounter {
            fail_unmount: true,
            ..Default::default()
        };
        let manager = fx.manager(&busy);
        let err = manager.release(&record, false).unwrap_err();
        assert!(matches!(err, GraphError::UnmountFailed { .. }));
        assert_eq!(fx.driver.references(&record.mount_id), 0);
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
        assert!(manager.records().unwrap().is_empty());
    }

    #[test]
    fn missing_destination_fails_before_allocation() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);

        let err = manager
            .create(
                &"sha256:abc".into(),
                &fx.dir.path().join("nowhere"),
                &MountOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::MountFailed { .. }));
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
    }

    #[test]
    fn find_by_destination_or_mount_id() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);
        let record = manager
            .create(&"sha256:abc".into(), &fx.dest(), &MountOptions::default())
            .unwrap();

        assert_eq!(manager.find(&record.mount_id).unwrap(), record);
        let dest = fx.dir.path().join("dest");
        assert_eq!(manager.find(dest.to_str().unwrap()).unwrap(), record);
        assert!(manager.find("/definitely/not/mounted").is_err());

        manager.release(&record, false).unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);

        let mount_id = {
            let guard = manager
                .mount_scoped(&"sha256:abc".into(), &fx.dest(), &MountOptions::default())
                .unwrap();
            assert_eq!(guard.path(), fx.dest());
            guard.record().unwrap().mount_id.clone()
        };

        assert_eq!(fx.driver.references(&mount_id), 0);
        assert!(mounter.mounted.borrow().is_empty());
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
    }

    #[test]
    fn unknown_mount_option_is_rejected() {
        assert!(matches!(
            MountOptions::parse(&["ro", "suid"]),
            Err(GraphError::InvalidMountOption(o)) if o == "suid"
        ));
    }

    #[test]
    fn mountinfo_escapes_are_decoded() {
        assert_eq!(unescape_mountinfo("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_mountinfo("/plain"), "/plain");
        assert_eq!(unescape_mountinfo("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn failed_detach_is_reported_with_the_remount_error() {
        let target = Path::new("/mnt/dest");
        let remount = || io::Error::new(io::ErrorKind::PermissionDenied, "EPERM");

        let err = undo_bind(target, remount(), |_| Ok(()));
        assert_eq!(err.to_string(), "EPERM");

        let err = undo_bind(target, remount(), |_| {
            Err(io::Error::new(io::ErrorKind::ResourceBusy, "EBUSY"))
        });
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let message = err.to_string();
        assert!(message.contains("writable bind left at /mnt/dest"));
        assert!(message.contains("EBUSY"));
    }

    #[test]
    fn temp_destination_is_removed_on_release() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);

        let record = manager
            .create_in_temp_dir(&"sha256:abc".into(), &MountOptions::default())
            .unwrap();
        assert!(record.owns_destination);
        assert!(record.destination.is_dir());
        assert!(mounter.mounted.borrow().contains(&record.destination));

        // A later invocation only has the persisted record
        let persisted = manager.find(&record.mount_id).unwrap();
        assert!(persisted.owns_destination);
        manager.release(&persisted, false).unwrap();
        assert!(!record.destination.exists());
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
    }

    #[test]
    fn temp_destination_is_removed_when_mounting_fails() {
        let fx = Fixture::new();
        let mounter = RecordingMounter {
            fail_bind: true,
            ..Default::default()
        };
        let manager = fx.manager(&mounter);

        let err = manager
            .create_in_temp_dir(&"sha256:abc".into(), &MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::MountFailed { .. }));
        let attempted = mounter.attempted.borrow();
        assert_eq!(attempted.len(), 1);
        assert!(!attempted[0].exists());
        assert_eq!(fx.layers(), vec!["sha256:abc"]);
    }

    #[test]
    fn caller_destination_survives_release() {
        let fx = Fixture::new();
        let mounter = RecordingMounter::default();
        let manager = fx.manager(&mounter);

        let record = manager
            .create(&"sha256:abc".into(), &fx.dest(), &MountOptions::default())
            .unwrap();
        assert!(!record.owns_destination);
        manager.release(&record, false).unwrap();
        assert!(fx.dest().is_dir());
    }

    #[test]
    fn temp_destination_is_kept_while_still_mounted() {
        let fx = Fixture::new();
        let ok = RecordingMounter::default();
        let record = fx
            .manager(&ok)
            .create_in_temp_dir(&"sha256:abc".into(), &MountOptions::default())
            .unwrap();

        let busy = RecordingMounter {
            fail_unmount: true,
            ..Default::default()
        };
        assert!(fx.manager(&busy).release(&record, false).is_err());
        assert!(record.destination.is_dir());
        fs::remove_dir(&record.destination).unwrap();
    }

    #[test]
    fn layer_ids_are_unique() {
        let parent: ImageId = "sha256:abc".into();
        assert_ne!(new_layer_id(&parent), new_layer_id(&parent));
    }
}
