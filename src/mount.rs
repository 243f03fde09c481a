//! Mount operations
//!
//! Wraps the external mount tooling (`mount`, `umount`, `mkfs`, `blkid`)
//! behind a small helper that can also answer questions from the kernel
//! mount table. The table path is injectable so tests can supply their own.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::command::run_command;
use crate::error::{Error, Result};

/// Filesystem type used when formatting device-backed volumes.
pub const FS_TYPE: &str = "ext4";

const PROC_MOUNTS: &str = "/proc/mounts";

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
}

/// Mount helper bound to a mount-table path.
#[derive(Debug, Clone)]
pub struct Mounter {
    mount_table: PathBuf,
}

impl Default for Mounter {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }
}

impl Mounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an alternate mount table (for testing).
    pub fn with_mount_table(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }

    /// The mount-table entry whose target is exactly `target`, if any.
    pub fn find_mount(&self, target: &Path) -> Result<Option<MountEntry>> {
        let table = std::fs::read_to_string(&self.mount_table)?;
        for line in table.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(mount_point)) = (fields.next(), fields.next()) else {
                continue;
            };
            if Path::new(mount_point) == target {
                return Ok(Some(MountEntry {
                    source: source.to_string(),
                    target: mount_point.to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// Whether `path` is a mount point of anything.
    pub fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.find_mount(path)?.is_some())
    }

    /// Mount `source` at `target` with an optional filesystem type and
    /// mount options.
    pub async fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> Result<()> {
        let target_str = path_str(target)?;
        let opts = options.join(",");
        let mut args: Vec<&str> = Vec::new();
        if let Some(fstype) = fstype {
            args.extend(["-t", fstype]);
        }
        if !opts.is_empty() {
            args.extend(["-o", &opts]);
        }
        args.extend([source, target_str]);

        run_command("mount", &args).await.map_err(|e| Error::MountFailed {
            path: target_str.to_string(),
            reason: e.to_string(),
        })?;
        info!("mounted {} at {}", source, target_str);
        Ok(())
    }

    /// Bind-mount `source` onto `target`, read-only when requested.
    pub async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let mut options = vec!["bind"];
        if read_only {
            options.push("ro");
        }
        self.mount(path_str(source)?, target, None, &options).await
    }

    /// Unmount `target`.
    pub async fn unmount(&self, target: &Path) -> Result<()> {
        let target_str = path_str(target)?;
        run_command("umount", &[target_str])
            .await
            .map_err(|e| Error::UnmountFailed {
                path: target_str.to_string(),
                reason: e.to_string(),
            })?;
        info!("unmounted {}", target_str);
        Ok(())
    }

    /// Format `device` if it carries no filesystem, then mount it at
    /// `target`.
    pub async fn format_and_mount(&self, device: &Path, target: &Path) -> Result<()> {
        let device_str = path_str(device)?;
        if self.filesystem_type(device).await?.is_none() {
            info!("formatting {} as {}", device_str, FS_TYPE);
            run_command(&format!("mkfs.{FS_TYPE}"), &["-F", device_str]).await?;
        } else {
            debug!("{} already formatted", device_str);
        }
        self.mount(device_str, target, Some(FS_TYPE), &[]).await
    }

    /// The filesystem type on `device`, or None for an unformatted device.
    async fn filesystem_type(&self, device: &Path) -> Result<Option<String>> {
        let device_str = path_str(device)?;
        match run_command("blkid", &["-p", "-s", "TYPE", "-o", "value", device_str]).await {
            Ok(output) => {
                let fstype = output.trim();
                if fstype.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(fstype.to_string()))
                }
            }
            // blkid exits 2 when it finds nothing on the device.
            Err(Error::CommandFailed { status: Some(2), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Internal(format!("non-UTF-8 path {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mount_table(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_find_mount() {
        let table = mount_table(
            "sysfs /sys sysfs rw,nosuid 0 0\n\
             /dev/md127 /local/lssd ext4 rw,relatime 0 0\n\
             tmpfs /local/tmpfs tmpfs rw,size=131072k,huge=always 0 0\n",
        );
        let mounter = Mounter::with_mount_table(table.path());

        let entry = mounter.find_mount(Path::new("/local/lssd")).unwrap().unwrap();
        assert_eq!(entry.source, "/dev/md127");

        assert!(mounter.find_mount(Path::new("/local/pd")).unwrap().is_none());
        // Prefix of an existing target is not a match.
        assert!(mounter.find_mount(Path::new("/local")).unwrap().is_none());
    }

    #[test]
    fn test_is_mount_point() {
        let table = mount_table("tmpfs /local/tmpfs tmpfs rw 0 0\n");
        let mounter = Mounter::with_mount_table(table.path());
        assert!(mounter.is_mount_point(Path::new("/local/tmpfs")).unwrap());
        assert!(!mounter.is_mount_point(Path::new("/target")).unwrap());
    }

    #[test]
    fn test_missing_mount_table() {
        let mounter = Mounter::with_mount_table("/definitely/not/here");
        assert!(mounter.find_mount(Path::new("/local/pd")).is_err());
    }
}
