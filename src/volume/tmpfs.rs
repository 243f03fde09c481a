//! Size-capped in-memory volumes
//!
//! The tmpfs is mounted fresh at construction time; its contents do not
//! survive a driver restart. The kernel enforces the size cap through the
//! mount options.

use std::path::Path;

use crate::error::{Error, Result};
use crate::mount::Mounter;
use crate::quantity::Quantity;
use crate::volume::{create_dir_0750, LocalVolume};

/// Mount a tmpfs of `size` at `path`, creating the directory if needed.
/// Huge pages are requested unconditionally.
pub async fn tmpfs_volume(mounter: &Mounter, path: &Path, size: &Quantity) -> Result<LocalVolume> {
    if size.is_zero() {
        return Err(Error::Configuration(format!("bad tmpfs size {size}")));
    }

    create_dir_0750(path)?;

    let size_opt = format!("size={}M", size.mebibytes());
    mounter
        .mount("tmpfs", path, Some("tmpfs"), &[&size_opt, "huge=always"])
        .await?;

    Ok(LocalVolume::Tmpfs {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let mounter = Mounter::new();
        let err = tmpfs_volume(&mounter, Path::new("/local/tmpfs"), &Quantity::from_mib(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
