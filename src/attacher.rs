//! Persistent disk attachment
//!
//! The controller attaches each node's provisioned disk itself, outside the
//! orchestrator's own attach machinery, so the disk shows up on the node
//! before any workload asks for it. There is intentionally no detach: node
//! deletion is the reclaim trigger.
//!
//! Volume handles have the form `projects/<p>/zones/<z>/disks/<name>`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::typemap::ZONE_LABEL;

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";
const SOURCE_PREFIX: &str = "https://www.googleapis.com/compute/v1/";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ATTACH_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Cloud-side attach operations over an opaque volume handle.
#[async_trait]
pub trait Attacher: Send + Sync {
    /// Whether the disk named by `handle` is attached to `node_name`.
    async fn is_attached(&self, handle: &str, node_name: &str) -> Result<bool>;

    /// Attach the disk named by `handle` to `node_name`, waiting for the
    /// operation to complete.
    async fn attach(&self, handle: &str, node_name: &str) -> Result<()>;
}

/// A parsed volume handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub project: String,
    pub zone: String,
    pub name: String,
}

/// Parse `projects/<p>/zones/<z>/disks/<name>`. Anything that does not have
/// exactly six `/`-separated parts is rejected.
pub fn parse_volume_handle(handle: &str) -> Result<VolumeHandle> {
    let parts: Vec<&str> = handle.split('/').collect();
    if parts.len() != 6 {
        return Err(Error::BadVolumeHandle(handle.to_string()));
    }
    Ok(VolumeHandle {
        project: parts[1].to_string(),
        zone: parts[3].to_string(),
        name: parts[5].to_string(),
    })
}

/// The fully-qualified disk source URL for an attach request.
pub fn source_from_handle(handle: &str) -> String {
    format!("{SOURCE_PREFIX}{handle}")
}

// =============================================================================
// Compute API payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    #[serde(default)]
    disks: Vec<InstanceDisk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceDisk {
    #[serde(default)]
    device_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachDiskRequest {
    device_name: String,
    source: String,
    mode: String,
    #[serde(rename = "type")]
    disk_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    error: Option<OperationErrors>,
}

#[derive(Debug, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

// =============================================================================
// GCE Attacher
// =============================================================================

/// [`Attacher`] backed by the GCE compute API. Node zones come from the
/// orchestrator's topology label; credentials come from the instance
/// metadata server.
pub struct GceAttacher {
    kube: Client,
    http: reqwest::Client,
}

impl GceAttacher {
    pub fn new(kube: Client) -> Self {
        Self {
            kube,
            http: reqwest::Client::new(),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let token: TokenResponse = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(token.access_token)
    }

    async fn node_zone(&self, node_name: &str) -> Result<String> {
        let nodes: Api<Node> = Api::all(self.kube.clone());
        let node = nodes.get(node_name).await?;
        node.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(ZONE_LABEL))
            .cloned()
            .ok_or_else(|| Error::ZoneNotFound(node_name.to_string()))
    }

    async fn get_operation(&self, handle: &VolumeHandle, op_name: &str) -> Result<Operation> {
        let url = format!(
            "{COMPUTE_BASE}/projects/{}/zones/{}/operations/{op_name}",
            handle.project, handle.zone
        );
        let token = self.access_token().await?;
        Ok(self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[async_trait]
impl Attacher for GceAttacher {
    async fn is_attached(&self, handle: &str, node_name: &str) -> Result<bool> {
        let vol = parse_volume_handle(handle)?;
        let zone = self.node_zone(node_name).await?;

        let url = format!(
            "{COMPUTE_BASE}/projects/{}/zones/{zone}/instances/{node_name}",
            vol.project
        );
        let token = self.access_token().await?;
        let instance: Instance = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(instance.disks.iter().any(|disk| disk.device_name == vol.name))
    }

    async fn attach(&self, handle: &str, node_name: &str) -> Result<()> {
        let vol = parse_volume_handle(handle)?;

        let url = format!(
            "{COMPUTE_BASE}/projects/{}/zones/{}/instances/{node_name}/attachDisk",
            vol.project, vol.zone
        );
        let request = AttachDiskRequest {
            device_name: vol.name.clone(),
            source: source_from_handle(handle),
            mode: "READ_WRITE".to_string(),
            disk_type: "PERSISTENT".to_string(),
        };
        let token = self.access_token().await?;
        let op: Operation = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("attach of {} to {} started as {}", handle, node_name, op.name);

        let deadline = Instant::now() + ATTACH_POLL_TIMEOUT;
        loop {
            let polled = self.get_operation(&vol, &op.name).await?;
            if polled.status == "DONE" {
                if let Some(errors) = polled.error {
                    let details: Vec<String> = errors
                        .errors
                        .iter()
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .collect();
                    return Err(Error::AttachFailed {
                        volume: handle.to_string(),
                        node: node_name.to_string(),
                        reason: details.join("; "),
                    });
                }
                info!("attached {} to {}", handle, node_name);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::AttachFailed {
                    volume: handle.to_string(),
                    node: node_name.to_string(),
                    reason: format!("timed out waiting for operation {}", op.name),
                });
            }
            tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_handle() {
        let handle = "projects/dev-project/zones/us-central1-b/disks/pvc-eeb37e7c";
        let vol = parse_volume_handle(handle).unwrap();
        assert_eq!(vol.project, "dev-project");
        assert_eq!(vol.zone, "us-central1-b");
        assert_eq!(vol.name, "pvc-eeb37e7c");
    }

    #[test]
    fn test_parse_volume_handle_rejects_bad_forms() {
        for bad in [
            "",
            "pvc-eeb37e7c",
            "projects/p/zones/z/disks",
            "projects/p/zones/z/disks/name/extra",
        ] {
            assert!(
                matches!(parse_volume_handle(bad), Err(Error::BadVolumeHandle(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_source_from_handle() {
        assert_eq!(
            source_from_handle("projects/p/zones/z/disks/d"),
            "https://www.googleapis.com/compute/v1/projects/p/zones/z/disks/d"
        );
    }
}
