//! Claim reconciliation and orphan cleanup
//!
//! The claim loop runs only when an attacher is configured. It writes the
//! bound volume name back into the map and attaches the disk to its node.
//! The orphan sweep deletes claims whose node is gone and prunes their map
//! entries; stripping the retention finalizer is what finally releases the
//! backing volume.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolume, PersistentVolumeClaim};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::Api;
use tracing::{debug, info, warn};

use super::node::claim_phase;
use super::{strip_retention_finalizer, Controller};
use crate::error::{kube_not_found, Error, Result};
use crate::typemap::{encode_mapping, parse_mapping, VOLUME_TYPE_KEY};

impl Controller {
    /// One pass of the claim loop for the claim named `name`. Claim names
    /// equal node names; that equality is the only link between the loops.
    pub(super) async fn reconcile_claim(&self, name: &str) -> Result<()> {
        let attacher = self
            .attacher
            .as_ref()
            .ok_or_else(|| Error::Internal("claim loop requires an attacher".into()))?;

        let maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let config_map = match maps.get(&self.config.volume_type_map).await {
            Ok(cm) => cm,
            Err(err) => {
                info!("claim {} reconciled before mapping available", name);
                return Err(err.into());
            }
        };

        let empty = Default::default();
        let mut mapping = parse_mapping(config_map.data.as_ref().unwrap_or(&empty))?;
        let Some(info) = mapping.get(name).cloned() else {
            return Err(Error::Internal(format!("unknown node or claim {name}")));
        };

        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let pvc = claims.get(name).await?;

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_gone = match nodes.get(name).await {
            Ok(node) => node.metadata.deletion_timestamp.is_some(),
            Err(err) if kube_not_found(&err) => true,
            Err(err) => return Err(err.into()),
        };
        if node_gone {
            // The node doesn't exist, the claim should be deleted.
            return self.delete_claim(&pvc).await;
        }

        let bound = claim_phase(&pvc) == "Bound";
        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|spec| spec.volume_name.clone())
            .unwrap_or_default();

        let mut deferred: Option<Error> = None;

        // Update the mapping with the volume name, if known.
        if bound && info.disk.as_deref() != Some(volume_name.as_str()) {
            if let Some(old) = info.disk.as_deref().filter(|d| !d.is_empty()) {
                warn!(
                    "pv mapping mismatch for {}, replacing {} with {}",
                    name, old, volume_name
                );
            }
            let mut updated = info;
            updated.disk = Some(volume_name.clone());
            mapping.insert(name.to_string(), updated);

            let mut cm = config_map;
            cm.data
                .get_or_insert_with(Default::default)
                .insert(VOLUME_TYPE_KEY.to_string(), encode_mapping(&mapping));
            if let Err(err) = maps
                .replace(&self.config.volume_type_map, &PostParams::default(), &cm)
                .await
            {
                warn!("mapping update for {} failed, will requeue: {}", name, err);
                deferred = Some(err.into());
            }
        }

        // If the claim is bound but its disk isn't attached, attach it.
        if bound {
            let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
            let pv = volumes.get(&volume_name).await?;
            let handle = pv
                .spec
                .as_ref()
                .and_then(|spec| spec.csi.as_ref())
                .map(|csi| csi.volume_handle.clone())
                .ok_or_else(|| {
                    Error::Internal(format!("volume {volume_name} has no CSI handle"))
                })?;

            if !attacher.is_attached(&handle, name).await? {
                attacher.attach(&handle, name).await?;
                info!("attached disk for claim {}", name);
            }
        }

        debug!("reconciled claim {}", name);
        match deferred {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete a claim and strip its retention finalizer. The delete alone
    /// would block forever on the finalizer; the strip is what releases the
    /// backing volume.
    pub(super) async fn delete_claim(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let name = pvc
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Internal("claim without a name".into()))?;
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.config.namespace);

        match claims.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if kube_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        // The object lingers while finalizers remain; fetch the current
        // revision and strip ours.
        match claims.get(&name).await {
            Ok(mut fresh) => {
                if strip_retention_finalizer(&mut fresh.metadata) {
                    claims.replace(&name, &PostParams::default(), &fresh).await?;
                }
            }
            Err(err) if kube_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        info!("deleted claim {}", name);
        Ok(())
    }

    /// Delete every claim whose node no longer exists, and prune their map
    /// entries.
    pub(super) async fn sweep_orphans(&self) -> Result<()> {
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let nodes: Api<Node> = Api::all(self.client.clone());

        let claim_list = claims.list(&ListParams::default()).await?;
        let node_list = nodes.list(&ListParams::default()).await?;
        let live = live_node_names(&node_list.items);

        for pvc in &claim_list.items {
            let Some(name) = pvc.metadata.name.as_deref() else {
                continue;
            };
            if !live.contains(name) {
                self.delete_claim(pvc).await?;
            }
        }

        self.prune_mapping(&live).await
    }

    /// Drop map entries for nodes that no longer exist. Parse failures are
    /// left for the node loop's reset-and-repopulate path.
    async fn prune_mapping(&self, live: &BTreeSet<String>) -> Result<()> {
        let maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut config_map = match maps.get(&self.config.volume_type_map).await {
            Ok(cm) => cm,
            Err(err) if kube_not_found(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let empty = Default::default();
        let mut mapping = match parse_mapping(config_map.data.as_ref().unwrap_or(&empty)) {
            Ok(mapping) => mapping,
            Err(err) => {
                warn!("skipping mapping prune, bad mapping: {}", err);
                return Ok(());
            }
        };

        let before = mapping.len();
        mapping.retain(|node, _| live.contains(node));
        if mapping.len() == before {
            return Ok(());
        }

        config_map
            .data
            .get_or_insert_with(Default::default)
            .insert(VOLUME_TYPE_KEY.to_string(), encode_mapping(&mapping));
        maps.replace(&self.config.volume_type_map, &PostParams::default(), &config_map)
            .await?;
        info!("pruned {} stale mapping entries", before - mapping.len());
        Ok(())
    }
}

/// Names of nodes that exist and are not marked for deletion.
fn live_node_names(nodes: &[Node]) -> BTreeSet<String> {
    nodes
        .iter()
        .filter(|node| node.metadata.deletion_timestamp.is_none())
        .filter_map(|node| node.metadata.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn node(name: &str, deleted: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                deletion_timestamp: deleted.then(|| Time(k8s_openapi::chrono::Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_live_node_names() {
        let nodes = vec![node("a", false), node("b", true), node("c", false)];
        let live = live_node_names(&nodes);
        assert!(live.contains("a"));
        assert!(!live.contains("b"));
        assert!(live.contains("c"));
    }

    #[test]
    fn test_orphan_selection() {
        let live = live_node_names(&[node("a", false)]);
        let claims = ["a", "b", "c"];
        let orphaned: Vec<&str> = claims
            .iter()
            .copied()
            .filter(|name| !live.contains(*name))
            .collect();
        assert_eq!(orphaned, vec!["b", "c"]);
    }
}
