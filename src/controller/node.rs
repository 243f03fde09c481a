//! Node reconciliation
//!
//! Keeps the volume type map in step with node labels and makes sure every
//! pd-labeled node has its claim. A node that disappears triggers the
//! orphan sweep instead.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Node, PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::Api;
use tracing::{debug, error, info, warn};

use super::{ensure_retention_finalizer, Controller};
use crate::error::{kube_not_found, Error, Result};
use crate::quantity::Quantity;
use crate::typemap::{
    encode_mapping, info_from_node_labels, parse_mapping, VolumeTypeInfo, PD_VOLUME_TYPE,
    VOLUME_TYPE_KEY,
};

impl Controller {
    /// One pass of the node loop for the node named `name`.
    pub(super) async fn reconcile_node(&self, name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = match nodes.get(name).await {
            Ok(node) => node,
            Err(err) => {
                info!("node {} not fetchable, sweeping orphans: {}", name, err);
                if let Err(err) = self.sweep_orphans().await {
                    warn!("orphan sweep failed: {}", err);
                }
                return Ok(());
            }
        };

        if node.metadata.deletion_timestamp.is_some() {
            if let Err(err) = self.sweep_orphans().await {
                warn!("orphan sweep failed: {}", err);
            }
            return Ok(());
        }

        let maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut must_create = false;
        let mut config_map = match maps.get(&self.config.volume_type_map).await {
            Ok(cm) => cm,
            Err(err) if kube_not_found(&err) => {
                must_create = true;
                ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.config.volume_type_map.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
            Err(err) => {
                error!(
                    "get mapping {}/{} failed: {}",
                    self.config.namespace, self.config.volume_type_map, err
                );
                return Ok(());
            }
        };

        let mut mapping = if must_create {
            BTreeMap::new()
        } else {
            let empty = BTreeMap::new();
            match parse_mapping(config_map.data.as_ref().unwrap_or(&empty)) {
                Ok(mapping) => mapping,
                Err(err) => {
                    warn!("bad mapping (ignored, mapping recreated): {}", err);
                    BTreeMap::new()
                }
            }
        };

        let labels = node.metadata.labels.clone().unwrap_or_default();
        let mut info = match info_from_node_labels(name, &labels) {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                debug!("skipping non-cache node {}", name);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if info.volume_type == PD_VOLUME_TYPE {
            let class = self.config.pd_storage_class.clone().ok_or_else(|| {
                Error::Configuration(
                    "no PD storage class has been defined, PD volumes can't be used".into(),
                )
            })?;
            self.ensure_pd_claim(name, &class, &mut info).await?;
        }

        mapping.insert(name.to_string(), info.clone());
        config_map
            .data
            .get_or_insert_with(Default::default)
            .insert(VOLUME_TYPE_KEY.to_string(), encode_mapping(&mapping));

        if must_create {
            maps.create(&PostParams::default(), &config_map).await?;
        } else {
            maps.replace(&self.config.volume_type_map, &PostParams::default(), &config_map)
                .await?;
        }
        info!("updated mapping for node {}: {:?}", name, info);

        Ok(())
    }

    /// Make sure the claim for a pd node exists, captures its bound volume
    /// name into `info`, and carries the retention finalizer.
    async fn ensure_pd_claim(
        &self,
        node: &str,
        storage_class: &str,
        info: &mut VolumeTypeInfo,
    ) -> Result<()> {
        let size = info
            .size
            .clone()
            .filter(|s| !s.is_zero())
            .ok_or_else(|| {
                Error::Configuration(format!("no size given for PD cache on node {node}"))
            })?;

        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let (mut pvc, needs_create) = match claims.get(node).await {
            Ok(pvc) => {
                if claim_phase(&pvc) == "Bound" {
                    info.disk = pvc.spec.as_ref().and_then(|s| s.volume_name.clone());
                }
                (pvc, false)
            }
            Err(err) if kube_not_found(&err) => (
                desired_claim(node, &self.config.namespace, storage_class, &size),
                true,
            ),
            Err(err) => return Err(err.into()),
        };

        let changed = ensure_retention_finalizer(&mut pvc.metadata);
        if needs_create {
            claims.create(&PostParams::default(), &pvc).await?;
            info!("created claim for pd node {}", node);
        } else if changed {
            claims.replace(node, &PostParams::default(), &pvc).await?;
        }
        Ok(())
    }
}

/// The claim a pd node should have: named after the node, block mode,
/// exclusive writer, capacity from the size label.
fn desired_claim(
    node: &str,
    namespace: &str,
    storage_class: &str,
    size: &Quantity,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(node.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(storage_class.to_string()),
            volume_mode: Some("Block".to_string()),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size.to_k8s())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn claim_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_claim() {
        let size: Quantity = "50Gi".parse().unwrap();
        let pvc = desired_claim("node-a", "cache-ns", "hyperdisk", &size);

        assert_eq!(pvc.metadata.name.as_deref(), Some("node-a"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("cache-ns"));

        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("hyperdisk"));
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));
        assert_eq!(
            spec.access_modes.as_deref(),
            Some(&["ReadWriteOnce".to_string()][..])
        );
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "50Gi");
    }

    #[test]
    fn test_claim_phase() {
        let pvc = PersistentVolumeClaim::default();
        assert_eq!(claim_phase(&pvc), "");

        let pvc = PersistentVolumeClaim {
            status: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(claim_phase(&pvc), "Bound");
    }
}
