//! Persistent disk volumes
//!
//! The controller attaches one persistent disk per pd-labeled node with the
//! device name set to the disk name, so the device appears under the
//! platform's by-id directory. Until it does, construction signals Pending
//! and the caller retries.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mount::Mounter;
use crate::volume::{device_volume, LocalVolume, BY_ID_DIR};

/// Mount the attached disk `disk` at `mount_path`. Pending until the disk
/// name is known and its device link exists.
pub async fn pd_volume(mounter: &Mounter, disk: &str, mount_path: &Path) -> Result<LocalVolume> {
    pd_volume_in(mounter, Path::new(BY_ID_DIR), disk, mount_path).await
}

async fn pd_volume_in(
    mounter: &Mounter,
    by_id_dir: &Path,
    disk: &str,
    mount_path: &Path,
) -> Result<LocalVolume> {
    if disk.is_empty() {
        return Err(Error::Pending("empty disk name".into()));
    }

    let device = device_path_for_disk(by_id_dir, disk);
    if !device.exists() {
        return Err(Error::Pending(format!(
            "waiting for attach, {} does not yet exist",
            device.display()
        )));
    }

    device_volume(mounter, &device, mount_path).await
}

/// The canonical device link for an attached disk: `google-<disk>` in the
/// by-id directory.
fn device_path_for_disk(by_id_dir: &Path, disk: &str) -> PathBuf {
    by_id_dir.join(format!("google-{disk}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_for_disk() {
        assert_eq!(
            device_path_for_disk(Path::new("/dev/disk/by-id"), "pv-for-a"),
            PathBuf::from("/dev/disk/by-id/google-pv-for-a")
        );
    }

    #[tokio::test]
    async fn test_pending_before_attach() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Mounter::new();

        let err = pd_volume_in(&mounter, dir.path(), "pv-not-here", Path::new("/local/pd"))
            .await
            .unwrap_err();
        assert!(err.is_pending());

        let err = pd_volume_in(&mounter, dir.path(), "", Path::new("/local/pd"))
            .await
            .unwrap_err();
        assert!(err.is_pending());
    }
}
