//! Cluster controller
//!
//! Two cooperating watch loops converge on the same invariants: every live
//! cache-labeled node has one volume type map entry; every pd node has one
//! bound, attached, finalizer-pinned claim; every orphaned claim is deleted.
//!
//! Work items for the same key are serialized by construction (one consumer
//! per loop); failed reconciles are requeued with backoff according to the
//! error's [`ErrorAction`](crate::error::ErrorAction).

mod claim;
mod node;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::attacher::Attacher;
use crate::error::{Error, ErrorAction, Result};

/// Finalizer that pins a claim's backing volume for the life of its node.
/// Deletion of the claim blocks until the controller strips it.
pub const RETENTION_FINALIZER: &str = "node-cache.gke.io/in-use";

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Controller configuration, from CLI flags.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace holding the volume type map and the per-node claims.
    pub namespace: String,
    /// Name of the volume type config map.
    pub volume_type_map: String,
    /// Storage class for pd caches. When unset, pd caches are unsupported
    /// and the claim loop is disabled.
    pub pd_storage_class: Option<String>,
}

/// The cluster controller. Sole writer of the volume type map and of the
/// per-node claims.
pub struct Controller {
    client: Client,
    config: ControllerConfig,
    attacher: Option<Arc<dyn Attacher>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchTarget {
    Node,
    Claim,
}

impl Controller {
    pub fn new(
        client: Client,
        config: ControllerConfig,
        attacher: Option<Arc<dyn Attacher>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            attacher,
        })
    }

    /// Run both watch loops until one of them fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut handles = Vec::new();

        let nodes: Api<Node> = Api::all(self.client.clone());
        let this = self.clone();
        handles.push(tokio::spawn(async move {
            this.run_watch(nodes, WatchTarget::Node).await
        }));

        if self.attacher.is_some() {
            let claims: Api<PersistentVolumeClaim> =
                Api::namespaced(self.client.clone(), &self.config.namespace);
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.run_watch(claims, WatchTarget::Claim).await
            }));
            info!("claim loop enabled");
        } else {
            info!("no attacher configured, claim loop disabled");
        }

        let (joined, _, _) = futures::future::select_all(handles).await;
        match joined {
            Ok(Ok(())) => Err(Error::Internal("watch loop exited unexpectedly".into())),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Internal(format!("watch task failed: {e}"))),
        }
    }

    /// Consume a watch stream, reconciling each named object as events and
    /// requeues arrive. Reconciles for this loop run one at a time.
    async fn run_watch<K>(self: Arc<Self>, api: Api<K>, target: WatchTarget) -> Result<()>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut stream = watcher(api, watcher::Config::default()).boxed();

        loop {
            let names: Vec<String> = tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Applied(obj))) => vec![obj.name_any()],
                    Some(Ok(watcher::Event::Deleted(obj))) => vec![obj.name_any()],
                    Some(Ok(watcher::Event::Restarted(objs))) => {
                        objs.iter().map(|o| o.name_any()).collect()
                    }
                    Some(Err(e)) => {
                        warn!("{:?} watch error, watch will resume: {}", target, e);
                        continue;
                    }
                    None => return Err(Error::Internal(format!("{target:?} watch stream ended"))),
                },
                Some(name) = rx.recv() => vec![name],
            };

            for name in names {
                match self.dispatch(target, &name).await {
                    Ok(()) => {
                        attempts.remove(&name);
                    }
                    Err(err) => {
                        let attempt = attempts.entry(name.clone()).or_insert(0);
                        *attempt += 1;
                        match err.action() {
                            ErrorAction::NoRequeue => {
                                error!("{:?} {} failed, not requeued: {}", target, name, err);
                            }
                            action => {
                                let delay = match action {
                                    ErrorAction::RequeueAfter(d) => d,
                                    _ => backoff_delay(*attempt),
                                };
                                warn!(
                                    "{:?} {} failed, requeued in {:?}: {}",
                                    target, name, delay, err
                                );
                                let tx = tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = tx.send(name);
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, target: WatchTarget, name: &str) -> Result<()> {
        debug!("{:?} reconcile {}", target, name);
        match target {
            WatchTarget::Node => self.reconcile_node(name).await,
            WatchTarget::Claim => self.reconcile_claim(name).await,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_MAX)
}

/// Add the retention finalizer if absent. Returns whether the object
/// changed.
fn ensure_retention_finalizer(meta: &mut ObjectMeta) -> bool {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == RETENTION_FINALIZER) {
        false
    } else {
        finalizers.push(RETENTION_FINALIZER.to_string());
        true
    }
}

/// Remove the retention finalizer if present. Returns whether the object
/// changed.
fn strip_retention_finalizer(meta: &mut ObjectMeta) -> bool {
    match meta.finalizers.as_mut() {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != RETENTION_FINALIZER);
            finalizers.len() != before
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(60), BACKOFF_MAX);
    }

    #[test]
    fn test_finalizer_round_trip() {
        let mut meta = ObjectMeta::default();
        assert!(ensure_retention_finalizer(&mut meta));
        assert!(!ensure_retention_finalizer(&mut meta));
        assert_eq!(
            meta.finalizers.as_deref(),
            Some(&[RETENTION_FINALIZER.to_string()][..])
        );

        assert!(strip_retention_finalizer(&mut meta));
        assert!(!strip_retention_finalizer(&mut meta));
        let empty: &[String] = &[];
        assert_eq!(meta.finalizers.as_deref(), Some(empty));
    }

    #[test]
    fn test_strip_preserves_other_finalizers() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec![
                "kubernetes.io/pvc-protection".to_string(),
                RETENTION_FINALIZER.to_string(),
            ]),
            ..Default::default()
        };
        assert!(strip_retention_finalizer(&mut meta));
        assert_eq!(
            meta.finalizers.as_deref(),
            Some(&["kubernetes.io/pvc-protection".to_string()][..])
        );
    }
}
