//! Shared fixtures: an in-memory repository and a matching in-memory cluster

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chunkvault_core::{Checksum, DEFAULT_NAMESPACE};
use chunkvault_metadata::{
    Chunk, CounterDelta, File, InMemoryRepository, MetadataError, MetadataRepository, Node,
    NodeHealthUpdate, NodeStatus, Result,
};
use chunkvault_rebalancer::{RebalancerConfig, RunCoordinator};
use chunkvault_storage::{MemoryCluster, MemoryNode};
use std::sync::Arc;
use uuid::Uuid;

pub const NS: &str = DEFAULT_NAMESPACE;

pub struct TestCluster {
    pub repo: Arc<InMemoryRepository>,
    pub nodes: Arc<MemoryCluster>,
    files: u128,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            repo: Arc::new(InMemoryRepository::new()),
            nodes: Arc::new(MemoryCluster::new()),
            files: 0,
        }
    }

    /// Register an online node `n` with the given load
    pub fn node(&self, n: u128, load: i64) -> Node {
        let node = Node::new(Uuid::from_u128(n), format!("http://node{}:9000", n)).with_load(load);
        self.repo.insert_node(node.clone());
        // Materialize the in-memory endpoint
        self.nodes.node(&node.url);
        node
    }

    pub fn offline_node(&self, n: u128, load: i64) -> Node {
        self.insert(
            Node::new(Uuid::from_u128(n), format!("http://node{}:9000", n))
                .with_load(load)
                .with_status(NodeStatus::Offline),
        )
    }

    /// Register a prepared node record
    pub fn insert(&self, node: Node) -> Node {
        self.repo.insert_node(node.clone());
        self.nodes.node(&node.url);
        node
    }

    /// Register a file with one positional chunk per entry of `contents`,
    /// each stored on the given holders
    pub fn file(&mut self, contents: Vec<(Vec<u8>, Vec<&Node>)>) -> Vec<Chunk> {
        self.add_file(contents, false)
    }

    /// Register a single-chunk file whose blob lives under its checksum key
    pub fn content_addressed_chunk(&mut self, data: &[u8], holders: &[&Node]) -> Chunk {
        self.add_file(vec![(data.to_vec(), holders.to_vec())], true)
            .remove(0)
    }

    fn add_file(&mut self, contents: Vec<(Vec<u8>, Vec<&Node>)>, content_addressed: bool) -> Vec<Chunk> {
        self.files += 1;
        let file_id = Uuid::from_u128(0xf000 + self.files);
        let total: usize = contents.iter().map(|(data, _)| data.len()).sum();
        self.repo.insert_file(File {
            id: file_id,
            name: format!("file-{}.bin", self.files),
            size_bytes: total as i64,
            owner_id: Uuid::nil(),
            created_at: chrono::Utc::now(),
        });

        contents
            .iter()
            .enumerate()
            .map(|(i, (data, holders))| {
                let chunk = Chunk {
                    id: Uuid::from_u128((0xc000 + self.files) << 16 | i as u128),
                    file_id,
                    chunk_number: i as i32,
                    size_bytes: data.len() as i64,
                    checksum: Checksum::compute(data).to_hex(),
                    content_addressed,
                };
                self.place(&chunk, data, holders);
                chunk
            })
            .collect()
    }

    /// Register a single-chunk file
    pub fn chunk(&mut self, data: &[u8], holders: &[&Node]) -> Chunk {
        self.file(vec![(data.to_vec(), holders.to_vec())]).remove(0)
    }

    /// Insert `chunk`, link it to `holders` and seed its blob on each
    pub fn place(&self, chunk: &Chunk, data: &[u8], holders: &[&Node]) {
        self.repo
            .insert_chunk(chunk.clone())
            .expect("chunk numbers are unique per file");
        let key = chunk.object_key().as_path();
        for node in holders {
            self.repo.link(chunk.id, node.id);
            self.endpoint(node)
                .seed(NS, &key, Bytes::copy_from_slice(data));
        }
    }

    pub fn endpoint(&self, node: &Node) -> Arc<MemoryNode> {
        self.nodes.node(&node.url)
    }

    /// The blob stored for `chunk` on `node`, bypassing faults
    pub fn blob_on(&self, node: &Node, chunk: &Chunk) -> Option<Bytes> {
        self.endpoint(node).blob(NS, &chunk.object_key().as_path())
    }

    pub fn holders(&self, chunk: &Chunk) -> Vec<Uuid> {
        let mut ids = self.repo.replica_node_ids(chunk.id);
        ids.sort();
        ids
    }

    pub fn load_of(&self, node: &Node) -> i64 {
        self.repo.node(node.id).map(|n| n.load()).unwrap_or_default()
    }

    pub fn config(&self) -> RebalancerConfig {
        RebalancerConfig {
            transport_timeout_secs: 2,
            ..RebalancerConfig::default()
        }
    }

    pub fn coordinator(&self, config: RebalancerConfig) -> RunCoordinator {
        RunCoordinator::new(self.repo.clone(), self.nodes.clone(), config)
    }

    /// Coordinator whose repository misbehaves as described by `faults`
    pub fn faulty_coordinator(&self, faults: RepoFaults, config: RebalancerConfig) -> RunCoordinator {
        let repo = Arc::new(FaultyRepository {
            inner: self.repo.clone(),
            faults,
        });
        RunCoordinator::new(repo, self.nodes.clone(), config)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepoFaults {
    /// Reject counter updates that add load
    pub fail_increments: bool,
    /// Reject counter updates that remove load
    pub fail_decrements: bool,
    /// Another writer links the chunk just before every link write
    pub concurrent_links: bool,
}

/// In-memory repository with injected metadata failures
pub struct FaultyRepository {
    inner: Arc<InMemoryRepository>,
    faults: RepoFaults,
}

#[async_trait]
impl MetadataRepository for FaultyRepository {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.inner.list_nodes().await
    }

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
        self.inner.get_node(node_id).await
    }

    async fn adjust_node_counters(&self, node_id: Uuid, delta: CounterDelta) -> Result<Node> {
        if (delta.load > 0 && self.faults.fail_increments)
            || (delta.load < 0 && self.faults.fail_decrements)
        {
            return Err(MetadataError::Conflict(format!("counters of node {} locked", node_id)));
        }
        self.inner.adjust_node_counters(node_id, delta).await
    }

    async fn set_node_counters(&self, node_id: Uuid, load: i64, storage_usage: i64) -> Result<()> {
        self.inner.set_node_counters(node_id, load, storage_usage).await
    }

    async fn record_node_health(&self, node_id: Uuid, update: &NodeHealthUpdate) -> Result<Node> {
        self.inner.record_node_health(node_id, update).await
    }

    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>> {
        self.inner.get_file(file_id).await
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        self.inner.get_chunk(chunk_id).await
    }

    async fn under_replicated_chunks(&self, min_replicas: usize) -> Result<Vec<Chunk>> {
        self.inner.under_replicated_chunks(min_replicas).await
    }

    async fn chunks_with_checksum(&self, checksum: &str, size_bytes: i64) -> Result<Vec<Chunk>> {
        self.inner.chunks_with_checksum(checksum, size_bytes).await
    }

    async fn replica_nodes(&self, chunk_id: Uuid) -> Result<Vec<Node>> {
        self.inner.replica_nodes(chunk_id).await
    }

    async fn node_chunks(&self, node_id: Uuid) -> Result<Vec<Chunk>> {
        self.inner.node_chunks(node_id).await
    }

    async fn add_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        if self.faults.concurrent_links {
            self.inner.link(chunk_id, node_id);
        }
        self.inner.add_replica(chunk_id, node_id).await
    }

    async fn remove_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        self.inner.remove_replica(chunk_id, node_id).await
    }
}

/// Deterministic content of `len` bytes
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}
