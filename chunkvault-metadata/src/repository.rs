//! Metadata repository interface
//!
//! Every operation is individually atomic. Callers get no multi-record
//! transactions; the engine orders its writes so that a crash between two
//! calls leaves at worst a redundant blob, never a dangling replica link.

use crate::models::{Chunk, CounterDelta, File, Node, NodeHealthUpdate};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Metadata error types
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Durable store of files, chunks, nodes and replica links
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    // ===== NODES =====

    /// All nodes, ordered by id
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>>;

    /// Atomically add `delta` to a node's counters and return the new record
    async fn adjust_node_counters(&self, node_id: Uuid, delta: CounterDelta) -> Result<Node>;

    /// Overwrite a node's counters with recomputed values
    async fn set_node_counters(&self, node_id: Uuid, load: i64, storage_usage: i64) -> Result<()>;

    /// Persist the outcome of a liveness probe
    async fn record_node_health(&self, node_id: Uuid, update: &NodeHealthUpdate) -> Result<Node>;

    // ===== FILES & CHUNKS =====

    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>>;

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>>;

    /// Chunks with fewer than `min_replicas` links to online nodes,
    /// in file order (file creation, then chunk number)
    async fn under_replicated_chunks(&self, min_replicas: usize) -> Result<Vec<Chunk>>;

    /// Other chunks sharing this content (same checksum and size)
    async fn chunks_with_checksum(&self, checksum: &str, size_bytes: i64) -> Result<Vec<Chunk>>;

    // ===== REPLICAS =====

    /// Nodes holding a replica of the chunk, any status
    async fn replica_nodes(&self, chunk_id: Uuid) -> Result<Vec<Node>>;

    /// Chunks with a replica on the node
    async fn node_chunks(&self, node_id: Uuid) -> Result<Vec<Chunk>>;

    /// Record a replica link. Returns false if it already existed.
    async fn add_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool>;

    /// Drop a replica link. Returns false if it was already gone.
    async fn remove_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool>;
}

#[async_trait]
impl<T: MetadataRepository + ?Sized> MetadataRepository for Arc<T> {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        (**self).list_nodes().await
    }

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
        (**self).get_node(node_id).await
    }

    async fn adjust_node_counters(&self, node_id: Uuid, delta: CounterDelta) -> Result<Node> {
        (**self).adjust_node_counters(node_id, delta).await
    }

    async fn set_node_counters(&self, node_id: Uuid, load: i64, storage_usage: i64) -> Result<()> {
        (**self).set_node_counters(node_id, load, storage_usage).await
    }

    async fn record_node_health(&self, node_id: Uuid, update: &NodeHealthUpdate) -> Result<Node> {
        (**self).record_node_health(node_id, update).await
    }

    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>> {
        (**self).get_file(file_id).await
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        (**self).get_chunk(chunk_id).await
    }

    async fn under_replicated_chunks(&self, min_replicas: usize) -> Result<Vec<Chunk>> {
        (**self).under_replicated_chunks(min_replicas).await
    }

    async fn chunks_with_checksum(&self, checksum: &str, size_bytes: i64) -> Result<Vec<Chunk>> {
        (**self).chunks_with_checksum(checksum, size_bytes).await
    }

    async fn replica_nodes(&self, chunk_id: Uuid) -> Result<Vec<Node>> {
        (**self).replica_nodes(chunk_id).await
    }

    async fn node_chunks(&self, node_id: Uuid) -> Result<Vec<Chunk>> {
        (**self).node_chunks(node_id).await
    }

    async fn add_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        (**self).add_replica(chunk_id, node_id).await
    }

    async fn remove_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        (**self).remove_replica(chunk_id, node_id).await
    }
}
