//! Node transport trait
//!
//! Defines the interface every storage node is reached through. Blobs are
//! opaque bytes addressed by (namespace, key); namespaces map to buckets on
//! S3-compatible nodes.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Namespace unavailable: {0}")]
    Namespace(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl TransportError {
    /// Whether the object (not the node) was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Blob operations against a single storage node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Store a blob, replacing any previous content under the key
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> TransportResult<()>;

    /// Fetch a blob
    async fn get(&self, namespace: &str, key: &str) -> TransportResult<Bytes>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> TransportResult<()>;

    /// Check whether a blob exists
    async fn head(&self, namespace: &str, key: &str) -> TransportResult<bool>;

    /// Create the namespace if absent (idempotent)
    async fn ensure_namespace(&self, namespace: &str) -> TransportResult<()>;

    /// Liveness probe; returns the observed round-trip latency
    async fn probe(&self) -> TransportResult<Duration>;
}

/// Resolves a node URL to its transport
pub trait NodeConnector: Send + Sync {
    fn transport(&self, node_url: &str) -> TransportResult<Arc<dyn NodeTransport>>;
}

impl<T: NodeConnector + ?Sized> NodeConnector for Arc<T> {
    fn transport(&self, node_url: &str) -> TransportResult<Arc<dyn NodeTransport>> {
        (**self).transport(node_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::NotFound("file-chunks/abc/0".to_string());
        assert!(err.to_string().contains("abc/0"));
        assert!(err.is_not_found());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_not_found());
    }
}
