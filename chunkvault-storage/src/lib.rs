//! ChunkVault Node Transport
//!
//! Provides the per-node blob interface the placement engine talks to:
//! - `NodeTransport` trait (put/get/head/delete/ensure_namespace/probe)
//! - `NodeConnector` trait yielding one transport per node URL
//! - `S3Connector` for S3-compatible object stores (MinIO, AWS, R2)
//! - `MemoryCluster` for tests and local runs, with fault injection

pub mod memory;
pub mod s3;
pub mod transport;

pub use memory::{MemoryCluster, MemoryNode, NodeFaults};
pub use s3::{S3Connector, S3Transport};
pub use transport::{NodeConnector, NodeTransport, TransportError, TransportResult};

use serde::{Deserialize, Serialize};

/// S3 transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Region reported to the object store (ignored by MinIO)
    pub region: String,

    /// Static access key; falls back to the AWS environment chain when unset
    pub access_key: Option<String>,

    /// Static secret key
    pub secret_key: Option<String>,

    /// Use path-style addressing (required for MinIO)
    pub force_path_style: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
            force_path_style: true,
        }
    }
}

impl TransportConfig {
    /// Set static credentials
    pub fn with_credentials(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    /// Set region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}
