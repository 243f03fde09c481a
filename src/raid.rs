//! RAID array management over mdadm
//!
//! Builds and tears down md arrays for the local SSD pool. Arrays persist
//! across driver restarts, so initialization has to tolerate every partial
//! state a crash can leave behind: already assembled, metadata present on
//! some members only, or an inactive array squatting on the md device.

use std::os::unix::fs::FileTypeExt;

use tracing::{info, warn};

use crate::command::run_command;
use crate::error::{Error, Result};

const MDADM: &str = "/bin/mdadm";
const MDSTAT: &str = "/proc/mdstat";

/// RAID level of the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidMode {
    Striped,
    Mirrored,
}

impl RaidMode {
    fn level(self) -> &'static str {
        match self {
            RaidMode::Striped => "0",
            RaidMode::Mirrored => "1",
        }
    }
}

/// An md array over a fixed set of member block devices.
#[derive(Debug, Clone)]
pub struct RaidArray {
    target: String,
    members: Vec<String>,
    mode: RaidMode,
}

impl RaidArray {
    /// Striped (RAID 0) array over `members`.
    pub fn striped(target: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            target: target.into(),
            members,
            mode: RaidMode::Striped,
        }
    }

    /// Mirrored (RAID 1) array. `primary` is the preferred bootstrap device
    /// when an existing array is re-assembled.
    pub fn mirrored(target: impl Into<String>, primary: String, replicas: Vec<String>) -> Self {
        let mut members = vec![primary];
        members.extend(replicas);
        Self {
            target: target.into(),
            members,
            mode: RaidMode::Mirrored,
        }
    }

    /// The md device path, e.g. `/dev/md/lssd`.
    pub fn device(&self) -> &str {
        &self.target
    }

    /// Bring the array up, idempotently. A live array at the target is left
    /// alone; members carrying metadata are re-assembled; otherwise a new
    /// array is created.
    pub async fn init(&self) -> Result<()> {
        match self.mode {
            RaidMode::Striped => self.init_striped().await,
            RaidMode::Mirrored => self.init_mirrored().await,
        }
    }

    async fn init_striped(&self) -> Result<()> {
        if is_live_array(&self.target).await {
            return Ok(());
        }

        for member in &self.members {
            validate_member(member)?;
        }

        stop_inactive_arrays().await?;

        for member in &self.members {
            if has_raid_metadata(member).await {
                return assemble_striped(&self.target, &self.members).await;
            }
        }
        create_array(&self.target, self.mode, &self.members).await
    }

    async fn init_mirrored(&self) -> Result<()> {
        for member in &self.members {
            validate_member(member)?;
        }

        stop_inactive_arrays().await?;

        let (primary, replicas) = self
            .members
            .split_first()
            .ok_or_else(|| Error::Raid("mirrored array has no members".into()))?;

        if has_raid_metadata(primary).await {
            return assemble_mirrored(&self.target, primary, replicas).await;
        }
        for replica in replicas {
            if has_raid_metadata(replica).await {
                return assemble_mirrored(&self.target, replica, &self.members).await;
            }
        }
        create_array(&self.target, self.mode, &self.members).await
    }

    /// Stop the array. Errors are surfaced.
    pub async fn stop(&self) -> Result<()> {
        stop_array(&self.target).await
    }
}

async fn create_array(target: &str, mode: RaidMode, members: &[String]) -> Result<()> {
    let count = members.len().to_string();
    let mut args = vec![
        "--create",
        target,
        "--level",
        mode.level(),
        "--run",
        "--raid-devices",
        &count,
    ];
    args.extend(members.iter().map(String::as_str));
    run_mdadm(&args)
        .await
        .map_err(|e| Error::Raid(format!("creation of {target} over {members:?} failed: {e}")))?;
    info!("created array {} over {:?}", target, members);
    Ok(())
}

async fn assemble_striped(target: &str, members: &[String]) -> Result<()> {
    let mut args = vec!["--assemble", target];
    args.extend(members.iter().map(String::as_str));
    args.push("--run");
    run_mdadm(&args)
        .await
        .map_err(|e| Error::Raid(format!("existing assemble failed on {members:?}: {e}")))?;
    info!("assembled existing array {}", target);
    Ok(())
}

async fn assemble_mirrored(target: &str, existing: &str, others: &[String]) -> Result<()> {
    for device in others {
        if device != existing {
            // If the wipe failed the assemble below will report it.
            let _ = wipe_member(device).await;
        }
    }

    run_mdadm(&["--assemble", target, existing, "--run"])
        .await
        .map_err(|e| Error::Raid(format!("could not bootstrap assemble from {existing}: {e}")))?;

    let mut args = vec!["--add", target];
    args.extend(others.iter().map(String::as_str));
    if let Err(e) = run_mdadm(&args).await {
        // Leave as little behind as we can before reporting.
        let _ = run_mdadm(&["--stop", target]).await;
        return Err(Error::Raid(format!(
            "could not add devices to existing member {existing}/{others:?}: {e}"
        )));
    }
    info!("assembled existing mirror {} from {}", target, existing);
    Ok(())
}

/// Stop every inactive array the kernel reports. A leftover inactive array
/// holds its member devices and would make assembly fail. Stop failures are
/// logged and skipped.
async fn stop_inactive_arrays() -> Result<()> {
    let mdstat = tokio::fs::read_to_string(MDSTAT)
        .await
        .map_err(|e| Error::Raid(format!("cannot read {MDSTAT} for stopping inactive: {e}")))?;
    for device in inactive_arrays(&mdstat) {
        info!("stopping inactive array {}", device);
        if let Err(e) = stop_array(&device).await {
            warn!("could not stop inactive array {}, continuing anyway: {}", device, e);
        }
    }
    Ok(())
}

async fn stop_array(device: &str) -> Result<()> {
    run_mdadm(&["--stop", device])
        .await
        .map_err(|e| Error::Raid(format!("could not stop {device}: {e}")))?;
    Ok(())
}

/// Inactive md devices from the kernel's array status text, as `/dev/<md>`
/// paths. A status line reads `md127 : inactive sdb[3](S)`.
fn inactive_arrays(mdstat: &str) -> Vec<String> {
    let mut devices = Vec::new();
    for line in mdstat.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(name), Some(":"), Some("inactive"), Some(_member)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        {
            devices.push(format!("/dev/{name}"));
        }
    }
    devices
}

/// Zero the RAID superblock on a former member. If the device never carried
/// array metadata the command fails and there is nothing to recover.
async fn wipe_member(device: &str) -> Result<()> {
    if !std::path::Path::new(device).exists() {
        return Err(Error::Raid(format!("device {device} to be wiped does not exist")));
    }
    let _ = run_mdadm(&["--zero-superblock", device]).await;
    Ok(())
}

async fn is_live_array(device: &str) -> bool {
    run_mdadm(&["--detail", device]).await.is_ok()
}

async fn has_raid_metadata(device: &str) -> bool {
    run_mdadm(&["--examine", device]).await.is_ok()
}

fn validate_member(device: &str) -> Result<()> {
    let meta = std::fs::metadata(device).map_err(|e| {
        Error::Raid(format!("could not stat device {device}: {e}"))
    })?;
    if !meta.file_type().is_block_device() {
        return Err(Error::NotBlockDevice {
            device: device.to_string(),
        });
    }
    Ok(())
}

async fn run_mdadm(args: &[&str]) -> Result<String> {
    run_command(MDADM, args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_single() {
        let mdstat = "Personalities : [raid1]\n\
            md127 : inactive sdb[3](S)\n      10484736 blocks super 1.2\n\n\
            unused devices: <none>\n";
        assert_eq!(inactive_arrays(mdstat), vec!["/dev/md127"]);
    }

    #[test]
    fn test_inactive_none() {
        let mdstat = "Personalities : [raid1]\nunused devices: <none>\n";
        assert!(inactive_arrays(mdstat).is_empty());
    }

    #[test]
    fn test_inactive_multiple() {
        let mdstat = "Personalities : [raid1]\n\
            md127 : inactive sdb[3](S)\n      10484736 blocks super 1.2\n\n\
            md126 : inactive ram0[3](S)\n      10484736 blocks super 1.2\n";
        assert_eq!(inactive_arrays(mdstat), vec!["/dev/md127", "/dev/md126"]);
    }

    #[test]
    fn test_active_ignored() {
        let mdstat = "Personalities : [raid1]\n\
            md127 : active raid1 sdd[1] ram0[0]\n      130048 blocks super 1.2 [2/2] [UU]\n\n\
            unused devices: <none>\n";
        assert!(inactive_arrays(mdstat).is_empty());
    }

    #[test]
    fn test_mixed_returns_only_inactive() {
        let mdstat = "Personalities : [raid1]\n\
            md127 : active raid1 sdd[1] ram0[0]\n      130048 blocks super 1.2 [2/2] [UU]\n\n\
            md126 : inactive ram0[3](S)\n      10484736 blocks super 1.2\n";
        assert_eq!(inactive_arrays(mdstat), vec!["/dev/md126"]);
    }

    #[test]
    fn test_raid_mode_levels() {
        assert_eq!(RaidMode::Striped.level(), "0");
        assert_eq!(RaidMode::Mirrored.level(), "1");
    }

    #[test]
    fn test_mirrored_members_order() {
        let array = RaidArray::mirrored(
            "/dev/md/test",
            "/dev/sdb".to_string(),
            vec!["/dev/sdc".to_string(), "/dev/sdd".to_string()],
        );
        assert_eq!(array.members[0], "/dev/sdb");
        assert_eq!(array.members.len(), 3);
        assert_eq!(array.device(), "/dev/md/test");
    }
}
