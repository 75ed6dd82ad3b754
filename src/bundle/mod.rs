//! Runtime bundle export.
//!
//! A bundle is an uncompressed tar stream: `config.json`, `runtime.json`,
//! then the image's merged filesystem under `rootfs/`.

pub mod spec;

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tar::{EntryType, Header, HeaderMode};

use crate::cancel::CancelFlag;
use crate::error::{GraphError, Result};
use crate::graph::ImageId;
use crate::mount::{MountManager, MountOptions};

pub use spec::BundleSpec;

/// Prefix of every filesystem entry in the archive.
pub const ROOTFS_PREFIX: &str = "rootfs";

/// Optional callback invoked after each filesystem entry is archived.
pub type OnEntryArchived = Box<dyn FnMut(&Path)>;

/// Totals for one export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Filesystem entries written under `rootfs/`
    pub entries: u64,
    /// Regular file content bytes
    pub bytes_copied: u64,
}

/// Writes bundles for images reachable through a [`MountManager`].
pub struct BundleExporter<'m, 'a> {
    mounts: &'m MountManager<'a>,
    spec: BundleSpec,
    cancel: CancelFlag,
    on_entry: Option<OnEntryArchived>,
}

impl<'m, 'a> BundleExporter<'m, 'a> {
    pub fn new(mounts: &'m MountManager<'a>) -> Self {
        Self {
            mounts,
            spec: BundleSpec::for_host(),
            cancel: CancelFlag::default(),
            on_entry: None,
        }
    }

    pub fn with_spec(mut self, spec: BundleSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_entry(mut self, callback: OnEntryArchived) -> Self {
        self.on_entry = Some(callback);
        self
    }

    /// Export `image_id` into a new archive file at `dest`.
    ///
    /// A partially written archive is removed on failure.
    pub fn export(&mut self, image_id: &ImageId, dest: &Path) -> Result<ExportReport> {
        let file = fs::File::create(dest)?;
        let result = self.export_to(image_id, io::BufWriter::new(file));
        if result.is_err() {
            let _ = fs::remove_file(dest);
        }
        result
    }

    /// Export `image_id` as a tar stream into `writer`.
    ///
    /// The temporary mount is always unmounted and its directory removed,
    /// in that order, before the archive is finished.
    pub fn export_to<W: Write>(&mut self, image_id: &ImageId, writer: W) -> Result<ExportReport> {
        let tmp = tempfile::Builder::new().prefix("dg-bundle").tempdir()?;
        let mount_dir = tmp.path().join("mount");
        fs::DirBuilder::new().mode(0o755).create(&mount_dir)?;

        let mounts = self.mounts;
        let guard = mounts.mount_scoped(image_id, &mount_dir, &MountOptions::default())?;
        let root = guard.path().to_path_buf();

        let mut builder = tar::Builder::new(writer);
        let written = self
            .write_spec(&mut builder)
            .and_then(|()| self.write_rootfs(&mut builder, &root));

        let released = guard.release();
        let removed = match &released {
            Ok(()) => tmp.close(),
            Err(_) => {
                // Still mounted; removing it would walk into the image
                let kept = tmp.keep();
                tracing::warn!(path = %kept.display(), "Leaving temporary mount directory behind");
                Ok(())
            }
        };

        let report = written?;
        released?;
        removed?;
        builder.into_inner()?.flush()?;

        tracing::info!(
            image = %image_id,
            entries = report.entries,
            bytes = report.bytes_copied,
            "Bundle exported"
        );
        Ok(report)
    }

    fn write_spec<W: Write>(&self, builder: &mut tar::Builder<W>) -> Result<()> {
        let (config, runtime) = self.spec.documents()?;
        for (name, data) in [("config.json", config), ("runtime.json", runtime)] {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, name, data.as_slice())?;
        }
        Ok(())
    }

    fn write_rootfs<W: Write>(
        &mut self,
        builder: &mut tar::Builder<W>,
        root: &Path,
    ) -> Result<ExportReport> {
        let mut report = ExportReport::default();
        self.append_entry(builder, root, root, &mut report)?;
        Ok(report)
    }

    /// Archive `path`, then its children depth-first in name order.
    fn append_entry<W: Write>(
        &mut self,
        builder: &mut tar::Builder<W>,
        root: &Path,
        path: &Path,
        report: &mut ExportReport,
    ) -> Result<()> {
        self.cancel.check()?;

        let walk_err = |source: io::Error| GraphError::WalkError {
            path: path.to_path_buf(),
            source,
        };

        let meta = fs::symlink_metadata(path).map_err(walk_err)?;
        let file_type = meta.file_type();
        let name = archive_name(root, path);

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);

        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(walk_err)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &name, &target).map_err(walk_err)?;
        } else if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &name, io::empty()).map_err(walk_err)?;
        } else if file_type.is_file() {
            let size = meta.len();
            let file = open_sequential(path).map_err(walk_err)?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(size);
            builder
                .append_data(&mut header, &name, SizedReader::new(file, size))
                .map_err(walk_err)?;
            report.bytes_copied += size;
        } else if file_type.is_char_device() || file_type.is_block_device() || file_type.is_fifo() {
            header.set_entry_type(if file_type.is_char_device() {
                EntryType::Char
            } else if file_type.is_block_device() {
                EntryType::Block
            } else {
                EntryType::Fifo
            });
            header.set_size(0);
            let rdev = meta.rdev();
            header
                .set_device_major(nix::sys::stat::major(rdev as _) as u32)
                .and_then(|()| header.set_device_minor(nix::sys::stat::minor(rdev as _) as u32))
                .map_err(walk_err)?;
            builder.append_data(&mut header, &name, io::empty()).map_err(walk_err)?;
        } else {
            tracing::warn!(path = %path.display(), "Skipping socket");
            return Ok(());
        }

        report.entries += 1;
        if let Some(callback) = self.on_entry.as_mut() {
            callback(&name);
        }

        if file_type.is_dir() {
            let mut children: Vec<PathBuf> = fs::read_dir(path)
                .map_err(walk_err)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<io::Result<_>>()
                .map_err(walk_err)?;
            children.sort();
            for child in children {
                self.append_entry(builder, root, &child, report)?;
            }
        }

        Ok(())
    }
}

/// `rootfs/<path relative to root>`; the root itself is `rootfs`.
fn archive_name(root: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix(root).unwrap_or(path);
    Path::new(ROOTFS_PREFIX).join(relative)
}

/// Yields exactly `remaining` bytes of `inner`.
///
/// A file that grew after its header was written is cut at the header size;
/// one that shrank fails with `UnexpectedEof` instead of padding the entry.
struct SizedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank by {} bytes while archiving", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Open a file for a single front-to-back read.
fn open_sequential(path: &Path) -> io::Result<fs::File> {
    let file = fs::File::open(path)?;

    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;

        // SAFETY: the descriptor stays open for the duration of the call
        let rc = unsafe {
            nix::libc::posix_fadvise(file.as_raw_fd(), 0, 0, nix::libc::POSIX_FADV_SEQUENTIAL)
        };
        if rc != 0 {
            tracing::debug!(path = %path.display(), errno = rc, "posix_fadvise failed");
        }
    }

    Ok(file)
}
