//! Cache volume construction
//!
//! Looks the node up in the volume type map and builds the matching local
//! volume. The map read polls briefly because the controller may not have
//! written it yet; after that, absence of the node's entry and an
//! unattached disk both surface as Pending for the caller to retry.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use tokio::time::Instant;
use tracing::warn;

use super::{LSSD_DEVICE, LSSD_PATH, PD_PATH, TMPFS_PATH};
use crate::error::{Error, Result};
use crate::mount::Mounter;
use crate::quantity::Quantity;
use crate::typemap::{
    parse_mapping, LSSD_VOLUME_TYPE, PD_VOLUME_TYPE, TMPFS_VOLUME_TYPE,
};
use crate::volume::{lssd_volume, pd_volume, tmpfs_volume, LocalVolume};

const MAP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAP_POLL_TIMEOUT: Duration = Duration::from_secs(60);

pub(super) async fn create_cache_volume(
    client: kube::Client,
    node_name: &str,
    namespace: &str,
    volume_type_map: &str,
    mounter: &Mounter,
) -> Result<LocalVolume> {
    let maps: Api<ConfigMap> = Api::namespaced(client, namespace);

    let deadline = Instant::now() + MAP_POLL_TIMEOUT;
    let config_map = loop {
        match maps.get(volume_type_map).await {
            Ok(cm) => break cm,
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(Error::Pending(format!("no volume type map found: {err}")));
                }
                warn!("failed to get volume type map, retrying: {}", err);
                tokio::time::sleep(MAP_POLL_INTERVAL).await;
            }
        }
    };

    // A badly formed map is terminal, not pending: retrying won't fix it.
    let empty = Default::default();
    let mapping = parse_mapping(config_map.data.as_ref().unwrap_or(&empty))?;

    let Some(info) = mapping.get(node_name) else {
        return Err(Error::Pending(format!(
            "no volume type information for {node_name} found in {namespace}/{volume_type_map}"
        )));
    };

    match info.volume_type.as_str() {
        TMPFS_VOLUME_TYPE => {
            let size = info.size.clone().unwrap_or_else(|| Quantity::from_mib(0));
            tmpfs_volume(mounter, Path::new(TMPFS_PATH), &size).await
        }
        LSSD_VOLUME_TYPE => lssd_volume(mounter, LSSD_DEVICE, Path::new(LSSD_PATH)).await,
        PD_VOLUME_TYPE => {
            pd_volume(mounter, info.disk.as_deref().unwrap_or(""), Path::new(PD_PATH)).await
        }
        other => Err(Error::UnknownVolumeType(other.to_string())),
    }
}
