//! Local volumes
//!
//! A local volume is the in-process object behind one node's cache: a
//! filesystem path that can be bind-mounted into workload pods. Three
//! backings produce one: a size-capped tmpfs, a striped array over the
//! node's local SSDs, and a remotely-provisioned persistent disk. Dispatch
//! on the backing kind lives in the driver; this module only knows how to
//! construct each variant.

mod lssd;
mod pd;
mod tmpfs;

pub use lssd::lssd_volume;
pub use pd::pd_volume;
pub use tmpfs::tmpfs_volume;

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::mount::Mounter;

/// Directory where the cloud platform publishes stable device links.
pub const BY_ID_DIR: &str = "/dev/disk/by-id";

/// A constructed local volume. Exactly one exists per driver process; it is
/// never torn down by this system (process exit leaves mounts in place).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalVolume {
    /// In-memory filesystem mounted at `path`.
    Tmpfs { path: PathBuf },
    /// A single block device formatted and mounted.
    Device { device: PathBuf, mount: PathBuf },
    /// A striped array over local SSDs, formatted and mounted.
    Striped {
        array: PathBuf,
        members: Vec<PathBuf>,
        mount: PathBuf,
    },
}

impl LocalVolume {
    /// The bind-mountable filesystem path of this volume.
    pub fn path(&self) -> &Path {
        match self {
            LocalVolume::Tmpfs { path } => path,
            LocalVolume::Device { mount, .. } => mount,
            LocalVolume::Striped { mount, .. } => mount,
        }
    }
}

/// Produce a volume from a block device, formatting and mounting it if
/// needed. If the device is already mounted at `mount_path` the existing
/// mount is reused, so a driver restart lands on the same filesystem.
pub async fn device_volume(
    mounter: &Mounter,
    device: &Path,
    mount_path: &Path,
) -> Result<LocalVolume> {
    ensure_device_mounted(mounter, device, mount_path).await?;
    Ok(LocalVolume::Device {
        device: device.to_path_buf(),
        mount: mount_path.to_path_buf(),
    })
}

pub(crate) async fn ensure_device_mounted(
    mounter: &Mounter,
    device: &Path,
    mount_path: &Path,
) -> Result<()> {
    let resolved = std::fs::canonicalize(device)
        .map_err(|e| Error::Internal(format!("cannot resolve {}: {e}", device.display())))?;

    if let Some(entry) = mounter.find_mount(mount_path)? {
        let source = std::fs::canonicalize(&entry.source)
            .unwrap_or_else(|_| PathBuf::from(&entry.source));
        if source != resolved {
            return Err(Error::MountMismatch {
                mount_path: mount_path.display().to_string(),
                expected: resolved.display().to_string(),
                found: entry.source,
            });
        }
        info!(
            "found {} already mounted at {}",
            device.display(),
            mount_path.display()
        );
        return Ok(());
    }

    create_dir_0750(mount_path)?;
    mounter.format_and_mount(device, mount_path).await
}

pub(crate) fn create_dir_0750(path: &Path) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
        .map_err(|e| Error::Internal(format!("could not create {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_paths() {
        let tmpfs = LocalVolume::Tmpfs {
            path: PathBuf::from("/local/tmpfs"),
        };
        assert_eq!(tmpfs.path(), Path::new("/local/tmpfs"));

        let device = LocalVolume::Device {
            device: PathBuf::from("/dev/sdb"),
            mount: PathBuf::from("/local/pd"),
        };
        assert_eq!(device.path(), Path::new("/local/pd"));

        let striped = LocalVolume::Striped {
            array: PathBuf::from("/dev/md/lssd"),
            members: vec![PathBuf::from("/dev/nvme1n1")],
            mount: PathBuf::from("/local/lssd"),
        };
        assert_eq!(striped.path(), Path::new("/local/lssd"));
    }

    #[test]
    fn test_create_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");
        create_dir_0750(&target).unwrap();
        create_dir_0750(&target).unwrap();
        assert!(target.is_dir());
    }
}
