//! Local SSD volumes
//!
//! All of the node's local SSDs are pooled into one striped array, then
//! formatted and mounted like any other device. The array outlives the
//! driver, so construction leans on the RAID manager's idempotent init.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mount::Mounter;
use crate::raid::RaidArray;
use crate::volume::{ensure_device_mounted, LocalVolume, BY_ID_DIR};

/// Stable-link prefix the platform assigns to local SSD block devices.
const LOCAL_SSD_PREFIX: &str = "google-local-ssd-block";

/// Stripe every local SSD into `array_device` and mount it at `mount_path`.
pub async fn lssd_volume(
    mounter: &Mounter,
    array_device: &str,
    mount_path: &Path,
) -> Result<LocalVolume> {
    let members = discover_local_ssds(Path::new(BY_ID_DIR))?;
    if members.is_empty() {
        return Err(Error::Configuration(format!(
            "no {LOCAL_SSD_PREFIX}* devices found under {BY_ID_DIR}"
        )));
    }

    let array = RaidArray::striped(
        array_device,
        members.iter().map(|p| p.display().to_string()).collect(),
    );
    array.init().await?;

    ensure_device_mounted(mounter, Path::new(array.device()), mount_path).await?;
    Ok(LocalVolume::Striped {
        array: PathBuf::from(array_device),
        members,
        mount: mount_path.to_path_buf(),
    })
}

/// Local SSD device links under `by_id_dir`, sorted for a stable member
/// order.
fn discover_local_ssds(by_id_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut devices = Vec::new();
    for entry in std::fs::read_dir(by_id_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(LOCAL_SSD_PREFIX) {
            devices.push(by_id_dir.join(name));
        }
    }
    devices.sort();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_discover_local_ssds() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "google-local-ssd-block1",
            "google-local-ssd-block0",
            "google-persistent-disk-5",
            "nvme-nvme_card0_nvme_card0",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }

        let devices = discover_local_ssds(dir.path()).unwrap();
        assert_eq!(
            devices,
            vec![
                dir.path().join("google-local-ssd-block0"),
                dir.path().join("google-local-ssd-block1"),
            ]
        );
    }

    #[test]
    fn test_discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_local_ssds(dir.path()).unwrap().is_empty());
    }
}
