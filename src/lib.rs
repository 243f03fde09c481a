//! Node Cache - Per-Node Shared Cache Volumes
//!
//! A per-node, shared, ephemeral cache volume service for Kubernetes. One
//! logical volume is materialized on each participating node; every pod on
//! that node that requests the volume gets the same backing storage, which
//! outlives individual pods (but not the node). Three backings are
//! supported, selected by a node label: a size-capped tmpfs, a striped
//! array over the node's local SSDs, and a per-node persistent disk
//! provisioned and attached by the cluster controller.
//!
//! Two processes ship in this crate:
//!
//! - `node-cache-driver`: the per-node CSI plug-in, serving identity and
//!   node RPCs and constructing the local backing on first publish.
//! - `node-cache-controller`: the cluster reconciler, watching nodes and
//!   claims, publishing the volume type map, and provisioning + attaching
//!   persistent disks for pd nodes.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`error`] | Unified error taxonomy and requeue classification. |
//! | [`command`] | External command execution with combined output capture. |
//! | [`quantity`] | Kubernetes-style storage quantities. |
//! | [`raid`] | mdadm array lifecycle for the local SSD pool. |
//! | [`mount`] | Mount, bind-mount, unmount, and format-and-mount helpers. |
//! | [`volume`] | Local volume construction per backing kind. |
//! | [`typemap`] | The volume type map codec and node label reader. |
//! | [`attacher`] | Persistent disk attachment via the compute API. |
//! | [`controller`] | The node and claim watch loops. |
//! | [`csi`] | The CSI identity/node services and socket server. |

pub mod attacher;
pub mod command;
pub mod controller;
pub mod csi;
pub mod error;
pub mod mount;
pub mod quantity;
pub mod raid;
pub mod typemap;
pub mod volume;

pub use attacher::{Attacher, GceAttacher};
pub use controller::{Controller, ControllerConfig, RETENTION_FINALIZER};
pub use csi::Driver;
pub use error::{Error, ErrorAction, Result};
pub use quantity::Quantity;
pub use volume::LocalVolume;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
