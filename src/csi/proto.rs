//! Generated gRPC bindings for the CSI identity and node services.

#[allow(clippy::all)]
pub mod generated {
    tonic::include_proto!("csi.v1");
}

pub use generated::identity_server::{Identity, IdentityServer};
pub use generated::node_server::{Node, NodeServer};
pub use generated::*;
