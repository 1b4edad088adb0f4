//! Controller-specific error types.
//!
//! Library errors (Kubernetes, CLB, allocator) are wrapped here so every
//! reconciler returns a single error type to `kube_runtime`.

use clb_client::ClbError;
use kube::Error as KubeError;
use port_allocator::AllocError;
use thiserror::Error;

/// Errors that can occur in the CLB controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// CLB provider error
    #[error("CLB error: {0}")]
    Clb(#[from] ClbError),

    /// Port allocation failed
    #[error("Port allocation failed: {0}")]
    Allocation(#[from] AllocError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed port mapping annotation on a backend
    #[error("Invalid annotation: {0}")]
    InvalidAnnotation(String),

    /// JSON encoding of a status or annotation failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// A required object field is missing
    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// Metrics registry or HTTP server error
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ControllerError {
    /// Optimistic concurrency conflict on a Kubernetes write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Kube(KubeError::Api(resp)) if resp.code == 409)
    }

    /// The provider reports the load balancer does not exist.
    pub fn is_lb_not_found(&self) -> bool {
        matches!(self, ControllerError::Clb(e) if e.is_lb_not_found())
    }
}

impl From<prometheus::Error> for ControllerError {
    fn from(e: prometheus::Error) -> Self {
        ControllerError::Metrics(e.to_string())
    }
}
