//! Error types for ChunkVault
//!
//! Provides a unified error type for the shared core primitives.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, ChunkVaultError>;

/// Unified error type for ChunkVault core
#[derive(Error, Debug)]
pub enum ChunkVaultError {
    // ===== Checksum Errors =====
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // ===== Chunk Errors =====
    #[error("Chunk too large: {size} bytes (max: {max})")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("Invalid object key: {0}")]
    InvalidObjectKey(String),
}
