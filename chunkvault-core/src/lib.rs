//! ChunkVault Core Library
//!
//! Core abstractions shared by every ChunkVault crate:
//! - SHA-256 chunk checksums and the integrity gate used after every transfer
//! - Deterministic object keys for chunk blobs on storage nodes
//! - Common constants and error handling

pub mod checksum;
pub mod chunk;
pub mod error;

pub use checksum::{verify_checksum, Checksum};
pub use chunk::{check_chunk_size, ObjectKey};
pub use error::{ChunkVaultError, Result};

/// Largest chunk the upload path produces (5 MiB)
pub const MAX_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default floor on online replicas per chunk
pub const DEFAULT_MIN_REPLICAS: usize = 2;

/// Default bucket holding chunk blobs on every node
pub const DEFAULT_NAMESPACE: &str = "file-chunks";
