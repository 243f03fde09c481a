//! The per-node plug-in server
//!
//! Serves the CSI identity and node services over a Unix or TCP socket.
//! Every pod on the node that asks for the cache volume gets the same
//! backing: the driver constructs its one local volume lazily on the first
//! publish, from whatever the controller wrote into the volume type map,
//! and bind-mounts it into each target path after that.

mod cache;
mod identity;
mod node;
pub mod proto;
mod server;

pub use server::{parse_endpoint, Endpoint};

use std::sync::Arc;

use tokio::sync::OnceCell;
use tonic::Status;

use crate::error::{Error, Result};
use crate::mount::Mounter;
use crate::volume::LocalVolume;

/// Where each backing kind lands on the node.
pub const TMPFS_PATH: &str = "/local/tmpfs";
pub const LSSD_DEVICE: &str = "/dev/md/lssd";
pub const LSSD_PATH: &str = "/local/lssd";
pub const PD_PATH: &str = "/local/pd";

/// The CSI driver. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    client: kube::Client,
    endpoint: String,
    node_id: String,
    namespace: String,
    volume_type_map: String,
    driver_name: String,
    driver_version: String,
    mounter: Mounter,
    /// The node's one local volume, constructed on first publish and kept
    /// for the life of the process.
    volume: OnceCell<LocalVolume>,
}

impl Driver {
    pub fn new(
        client: kube::Client,
        endpoint: String,
        node_id: String,
        namespace: String,
        volume_type_map: String,
        driver_name: String,
    ) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                client,
                endpoint,
                node_id,
                namespace,
                volume_type_map,
                driver_name,
                driver_version: env!("CARGO_PKG_VERSION").to_string(),
                mounter: Mounter::new(),
                volume: OnceCell::new(),
            }),
        }
    }

    /// Serve the identity and node services. Normally runs forever.
    pub async fn run(&self) -> Result<()> {
        server::serve(self.clone()).await
    }

    /// The node's local volume, constructing it on first use. Construction
    /// is serialized; concurrent publishes wait for the winner.
    async fn local_volume(&self) -> Result<&LocalVolume> {
        self.inner
            .volume
            .get_or_try_init(|| {
                cache::create_cache_volume(
                    self.inner.client.clone(),
                    &self.inner.node_id,
                    &self.inner.namespace,
                    &self.inner.volume_type_map,
                    &self.inner.mounter,
                )
            })
            .await
    }
}

/// Map driver errors onto plug-in status codes: Pending means "not ready,
/// ask again" and becomes ABORTED so the orchestrator retries the publish.
fn publish_status(err: Error) -> Status {
    if err.is_pending() {
        Status::aborted(format!("local volume not ready: {err}"))
    } else {
        Status::internal(format!("local volume creation failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_status_codes() {
        let status = publish_status(Error::Pending("waiting".into()));
        assert_eq!(status.code(), tonic::Code::Aborted);

        let status = publish_status(Error::Internal("boom".into()));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
