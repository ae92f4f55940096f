//! In-memory metadata repository
//!
//! Used for testing and local development. Not persistent. Counts every
//! mutating call so tests can assert that a pass changed nothing.

use crate::models::{Chunk, CounterDelta, File, Node, NodeHealthUpdate, NodeStatus};
use crate::repository::{MetadataError, MetadataRepository, Result};
use async_trait::async_trait;
use chunkvault_core::check_chunk_size;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct State {
    files: HashMap<Uuid, File>,
    chunks: HashMap<Uuid, Chunk>,
    nodes: BTreeMap<Uuid, Node>,
    /// (chunk_id, node_id)
    replicas: BTreeSet<(Uuid, Uuid)>,
}

impl State {
    fn node_mut(&mut self, node_id: Uuid) -> Result<&mut Node> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| MetadataError::NotFound(format!("node {}", node_id)))
    }

    fn online_replica_count(&self, chunk_id: Uuid) -> usize {
        self.replicas
            .range((chunk_id, Uuid::nil())..=(chunk_id, Uuid::from_u128(u128::MAX)))
            .filter(|(_, node_id)| self.nodes.get(node_id).map_or(false, |n| n.is_online()))
            .count()
    }

    /// Sort key for file order
    fn file_order(&self, chunk: &Chunk) -> (Option<chrono::DateTime<chrono::Utc>>, Uuid, i32) {
        let created = self.files.get(&chunk.file_id).map(|f| f.created_at);
        (created, chunk.file_id, chunk.chunk_number)
    }
}

/// In-memory metadata repository
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
    mutations: AtomicU64,
}

impl InMemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    // ===== SEEDING =====

    pub fn insert_file(&self, file: File) {
        self.state.write().files.insert(file.id, file);
    }

    /// Insert a chunk. Rejects an impossible size and a duplicate chunk
    /// number within a file.
    pub fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
        let size = usize::try_from(chunk.size_bytes)
            .map_err(|_| MetadataError::Invalid(format!("negative size for chunk {}", chunk.id)))?;
        check_chunk_size(size).map_err(|e| MetadataError::Invalid(e.to_string()))?;

        let mut state = self.state.write();
        let duplicate = state.chunks.values().any(|c| {
            c.id != chunk.id && c.file_id == chunk.file_id && c.chunk_number == chunk.chunk_number
        });
        if duplicate {
            return Err(MetadataError::Conflict(format!(
                "chunk {} of file {} already exists",
                chunk.chunk_number, chunk.file_id
            )));
        }
        state.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    pub fn insert_node(&self, node: Node) {
        self.state.write().nodes.insert(node.id, node);
    }

    /// Record a replica link without touching node counters
    pub fn link(&self, chunk_id: Uuid, node_id: Uuid) {
        self.state.write().replicas.insert((chunk_id, node_id));
    }

    pub fn set_node_status(&self, node_id: Uuid, status: NodeStatus) -> Result<()> {
        self.state.write().node_mut(node_id)?.status = status;
        Ok(())
    }

    // ===== INSPECTION =====

    /// Snapshot of a node record
    pub fn node(&self, node_id: Uuid) -> Option<Node> {
        self.state.read().nodes.get(&node_id).cloned()
    }

    /// Node ids holding the chunk, sorted
    pub fn replica_node_ids(&self, chunk_id: Uuid) -> Vec<Uuid> {
        self.state
            .read()
            .replicas
            .iter()
            .filter(|(c, _)| *c == chunk_id)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn online_replica_count(&self, chunk_id: Uuid) -> usize {
        self.state.read().online_replica_count(chunk_id)
    }

    /// Every chunk id
    pub fn chunk_ids(&self) -> Vec<Uuid> {
        self.state.read().chunks.keys().copied().collect()
    }

    /// Number of mutating calls that changed state
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl MetadataRepository for InMemoryRepository {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().nodes.values().cloned().collect())
    }

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
        Ok(self.node(node_id))
    }

    async fn adjust_node_counters(&self, node_id: Uuid, delta: CounterDelta) -> Result<Node> {
        let mut state = self.state.write();
        let node = state.node_mut(node_id)?;
        node.apply(delta);
        let node = node.clone();
        drop(state);

        if !delta.is_zero() {
            self.mutated();
        }
        Ok(node)
    }

    async fn set_node_counters(&self, node_id: Uuid, load: i64, storage_usage: i64) -> Result<()> {
        let mut state = self.state.write();
        let node = state.node_mut(node_id)?;
        let changed = node.load() != load || node.storage_usage() != storage_usage;
        node.reset_counters(load, storage_usage);
        drop(state);

        if changed {
            self.mutated();
        }
        Ok(())
    }

    async fn record_node_health(&self, node_id: Uuid, update: &NodeHealthUpdate) -> Result<Node> {
        let mut state = self.state.write();
        let node = state.node_mut(node_id)?;
        node.apply_health(update);
        Ok(node.clone())
    }

    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>> {
        Ok(self.state.read().files.get(&file_id).cloned())
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        Ok(self.state.read().chunks.get(&chunk_id).cloned())
    }

    async fn under_replicated_chunks(&self, min_replicas: usize) -> Result<Vec<Chunk>> {
        let state = self.state.read();
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| state.online_replica_count(c.id) < min_replicas)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| state.file_order(c));
        Ok(chunks)
    }

    async fn chunks_with_checksum(&self, checksum: &str, size_bytes: i64) -> Result<Vec<Chunk>> {
        let state = self.state.read();
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.size_bytes == size_bytes && c.checksum.eq_ignore_ascii_case(checksum))
            .cloned()
            .collect();
        chunks.sort_by_key(|c| state.file_order(c));
        Ok(chunks)
    }

    async fn replica_nodes(&self, chunk_id: Uuid) -> Result<Vec<Node>> {
        let state = self.state.read();
        Ok(state
            .replicas
            .range((chunk_id, Uuid::nil())..=(chunk_id, Uuid::from_u128(u128::MAX)))
            .filter_map(|(_, node_id)| state.nodes.get(node_id).cloned())
            .collect())
    }

    async fn node_chunks(&self, node_id: Uuid) -> Result<Vec<Chunk>> {
        let state = self.state.read();
        let mut chunks: Vec<Chunk> = state
            .replicas
            .iter()
            .filter(|(_, n)| *n == node_id)
            .filter_map(|(chunk_id, _)| state.chunks.get(chunk_id).cloned())
            .collect();
        chunks.sort_by_key(|c| state.file_order(c));
        Ok(chunks)
    }

    async fn add_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        let mut state = self.state.write();
        if !state.chunks.contains_key(&chunk_id) {
            return Err(MetadataError::NotFound(format!("chunk {}", chunk_id)));
        }
        if !state.nodes.contains_key(&node_id) {
            return Err(MetadataError::NotFound(format!("node {}", node_id)));
        }
        let inserted = state.replicas.insert((chunk_id, node_id));
        drop(state);

        if inserted {
            self.mutated();
        }
        Ok(inserted)
    }

    async fn remove_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        let removed = self.state.write().replicas.remove(&(chunk_id, node_id));
        if removed {
            self.mutated();
        }
        Ok(removed)
    }
}
