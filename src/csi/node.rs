//! CSI node service
//!
//! Publish bind-mounts the node's one local volume into the caller's
//! target path; unpublish unmounts it. Publishing to a path that is
//! already a mount point is a no-op so the orchestrator can safely retry.

use std::path::Path;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use super::proto::{
    Node, NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
};
use super::{publish_status, Driver};
use crate::volume::create_dir_0750;

#[tonic::async_trait]
impl Node for Driver {
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("NodePublishVolume for {} at {}", req.volume_id, req.target_path);

        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }

        let volume = self.local_volume().await.map_err(|err| {
            let status = publish_status(err);
            error!("NodePublishVolume: {}", status.message());
            status
        })?;

        let target = Path::new(&req.target_path);
        if !target.exists() {
            create_dir_0750(target).map_err(|err| {
                Status::internal(format!("Target mount point creation failed: {err}"))
            })?;
        } else if self
            .inner
            .mounter
            .is_mount_point(target)
            .map_err(|err| Status::internal(format!("Target mount point in bad state: {err}")))?
        {
            // Already published; nothing to do.
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        self.inner
            .mounter
            .bind_mount(volume.path(), target, req.readonly)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        info!("mounted {} to {}", volume.path().display(), req.target_path);

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("NodeUnpublishVolume at {}", req.target_path);

        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }

        self.inner
            .mounter
            .unmount(Path::new(&req.target_path))
            .await
            .map_err(|err| {
                Status::internal(format!(
                    "Unmount of bind mount at {} failed: {err}",
                    req.target_path
                ))
            })?;
        info!("unmounted {}", req.target_path);

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        // No staging, no expansion, no stats.
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.inner.node_id.clone(),
            max_volumes_per_node: 0,
        }))
    }
}
