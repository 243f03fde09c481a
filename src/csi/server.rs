//! Socket endpoint handling and the gRPC server
//!
//! The endpoint flag is URI-form: `unix:<path>` (a stale socket file is
//! removed, the parent directory must already exist) or `tcp://<addr>`.
//! Anything else is rejected.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;
use url::Url;

use super::proto::{IdentityServer, NodeServer};
use super::Driver;
use crate::error::{Error, Result};

/// A parsed `--endpoint` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

/// Parse an endpoint URI into a bind target.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::Configuration(format!("cannot parse endpoint {endpoint}: {e}")))?;
    match url.scheme() {
        "unix" => {
            let path = url.path();
            if path.is_empty() {
                return Err(Error::Configuration(format!(
                    "endpoint {endpoint} has no socket path"
                )));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        }
        "tcp" => {
            let host = url.host_str().ok_or_else(|| {
                Error::Configuration(format!("endpoint {endpoint} has no bind address"))
            })?;
            let addr = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            Ok(Endpoint::Tcp(addr))
        }
        other => Err(Error::Configuration(format!(
            "{other} endpoint scheme not supported"
        ))),
    }
}

pub(super) async fn serve(driver: Driver) -> Result<()> {
    let endpoint = parse_endpoint(&driver.inner.endpoint)?;

    let router = Server::builder()
        .add_service(IdentityServer::new(driver.clone()))
        .add_service(NodeServer::new(driver.clone()));

    match endpoint {
        Endpoint::Unix(path) => {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("removed stale socket {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::Configuration(format!(
                        "failed to remove {}: {e}",
                        path.display()
                    )))
                }
            }

            // The plugin watcher creates the socket directory; its absence
            // means we're running somewhere we shouldn't be.
            let parent = path
                .parent()
                .ok_or_else(|| Error::Configuration(format!("bad socket path {}", path.display())))?;
            if !parent.is_dir() {
                return Err(Error::Configuration(format!(
                    "expected plugin watcher to create parent dir {} but did not find such a dir",
                    parent.display()
                )));
            }

            let listener = UnixListener::bind(&path)?;
            info!("listening on {}", path.display());
            router
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
                .map_err(|e| Error::Internal(format!("serving failed: {e}")))
        }
        Endpoint::Tcp(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| Error::Configuration(format!("bad bind address {addr}: {e}")))?;
            info!("listening on {}", addr);
            router
                .serve(addr)
                .await
                .map_err(|e| Error::Internal(format!("serving failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_endpoint() {
        assert_eq!(
            parse_endpoint("unix:/tmp/csi.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/csi.sock"))
        );
        assert_eq!(
            parse_endpoint("unix:///var/lib/kubelet/plugins/cache/csi.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/var/lib/kubelet/plugins/cache/csi.sock"))
        );
    }

    #[test]
    fn test_parse_tcp_endpoint() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:10000").unwrap(),
            Endpoint::Tcp("127.0.0.1:10000".to_string())
        );
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(parse_endpoint("http://localhost:1234").is_err());
        assert!(parse_endpoint("not a url").is_err());
    }
}
