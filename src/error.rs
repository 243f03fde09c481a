//! Error types for the node cache driver and controller
//!
//! One taxonomy covers both processes: configuration errors (fatal for the
//! operation), pending errors (the backing exists in plan but not in fact,
//! callers retry), transient external errors (requeued by the watch loops),
//! and terminal external errors (surfaced with context).

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the driver and controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested backing is not ready yet. RPC callers receive a
    /// retryable status and are expected to call again.
    #[error("Not ready yet: {0}")]
    Pending(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Label {label} not found on node {node}")]
    LabelNotFound { label: String, node: String },

    // =========================================================================
    // Volume Type Map Errors
    // =========================================================================
    #[error("Key {key} not found in volume type config map")]
    MapKeyNotFound { key: String },

    #[error("Bad volume type config map: {0}")]
    MapParse(String),

    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("Unknown volume type {0}")]
    UnknownVolumeType(String),

    // =========================================================================
    // Command / Device Errors
    // =========================================================================
    #[error("{command} {args} failed ({status:?}): {output}")]
    CommandFailed {
        command: String,
        args: String,
        status: Option<i32>,
        output: String,
    },

    #[error("Expected {device} to be a block device")]
    NotBlockDevice { device: String },

    #[error("RAID error: {0}")]
    Raid(String),

    #[error("Mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    #[error("Unmount failed at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },

    #[error("{mount_path} already mounted, but not to expected device {expected}: {found}")]
    MountMismatch {
        mount_path: String,
        expected: String,
        found: String,
    },

    // =========================================================================
    // Attacher Errors
    // =========================================================================
    #[error("Bad volume handle {0}")]
    BadVolumeHandle(String),

    #[error("No zone found for node {0}")]
    ZoneNotFound(String),

    #[error("Could not attach {volume} to {node}: {reason}")]
    AttachFailed {
        volume: String,
        node: String,
        reason: String,
    },

    #[error("Compute API error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action a watch loop should take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient external errors - retry with backoff
            Error::Kube(_) | Error::Http(_) | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // The attach may have failed on a polling timeout; retry soon
            Error::AttachFailed { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Configuration/parse errors - don't retry automatically
            Error::Configuration(_)
            | Error::QuantityParse(_)
            | Error::MapParse(_)
            | Error::UnknownVolumeType(_)
            | Error::BadVolumeHandle(_)
            | Error::LabelNotFound { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this is the distinguished "ask again later" kind
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Pending(_))
    }

    /// Check if this error reports a missing map key or node label
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::MapKeyNotFound { .. } | Error::LabelNotFound { .. }
        )
    }
}

/// Whether a Kubernetes API error is a 404 for the requested object.
pub fn kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Result type alias for the driver and controller
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::AttachFailed {
            volume: "projects/p/zones/z/disks/d".into(),
            node: "node-a".into(),
            reason: "timed out".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::Internal("whoops".into());
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "net down"));
        assert!(transient.is_retryable());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_pending_distinguishable() {
        let pending = Error::Pending("waiting for attach".into());
        assert!(pending.is_pending());
        assert!(!pending.is_not_found());

        let missing = Error::MapKeyNotFound {
            key: "volume-types".into(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_pending());
    }
}
