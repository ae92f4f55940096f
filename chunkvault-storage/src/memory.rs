//! In-memory node transport
//!
//! Used for testing and local development. Not persistent. Each node can be
//! told to misbehave (unreachable, failing reads or writes, corrupted reads,
//! slow responses) so failure paths of the engine can be exercised.

use crate::transport::{NodeConnector, NodeTransport, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Faults injected into a node's responses
#[derive(Debug, Clone, Default)]
pub struct NodeFaults {
    /// Every operation fails with a transport error
    pub unreachable: bool,
    /// `get` fails with a transport error
    pub fail_get: bool,
    /// `put` fails with a transport error
    pub fail_put: bool,
    /// `delete` fails with a transport error
    pub fail_delete: bool,
    /// `get` returns content with one byte flipped
    pub corrupt_reads: bool,
    /// Sleep before answering
    pub delay: Option<Duration>,
}

/// A single in-memory storage node
#[derive(Default)]
pub struct MemoryNode {
    /// namespace -> key -> blob
    namespaces: RwLock<HashMap<String, HashMap<String, Bytes>>>,
    faults: RwLock<NodeFaults>,

    /// Operation counters
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryNode {
    /// Create an empty node
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node's fault configuration
    pub fn set_faults(&self, faults: NodeFaults) {
        *self.faults.write() = faults;
    }

    /// Clear all injected faults
    pub fn heal(&self) {
        *self.faults.write() = NodeFaults::default();
    }

    /// Insert a blob directly, creating the namespace
    pub fn seed(&self, namespace: &str, key: &str, data: impl Into<Bytes>) {
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    /// Read a blob directly, bypassing faults
    pub fn blob(&self, namespace: &str, key: &str) -> Option<Bytes> {
        self.namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    /// Whether the namespace exists
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.read().contains_key(namespace)
    }

    /// Number of blobs across all namespaces
    pub fn blob_count(&self) -> usize {
        self.namespaces.read().values().map(|ns| ns.len()).sum()
    }

    /// Number of successful `put` calls
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of successful `get` calls
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of successful `delete` calls
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> TransportResult<NodeFaults> {
        let faults = self.faults.read().clone();
        if let Some(delay) = faults.delay {
            tokio::time::sleep(delay).await;
        }
        if faults.unreachable {
            return Err(TransportError::Transport("connection refused".to_string()));
        }
        Ok(faults)
    }
}

#[async_trait]
impl NodeTransport for MemoryNode {
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> TransportResult<()> {
        let faults = self.enter().await?;
        if faults.fail_put {
            return Err(TransportError::Transport("injected put failure".to_string()));
        }

        let mut namespaces = self.namespaces.write();
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| TransportError::Namespace(namespace.to_string()))?;
        ns.insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> TransportResult<Bytes> {
        let faults = self.enter().await?;
        if faults.fail_get {
            return Err(TransportError::Transport("injected get failure".to_string()));
        }

        let data = self
            .blob(namespace, key)
            .ok_or_else(|| TransportError::NotFound(format!("{}/{}", namespace, key)))?;
        self.gets.fetch_add(1, Ordering::Relaxed);

        if faults.corrupt_reads {
            let mut corrupted = data.to_vec();
            match corrupted.first_mut() {
                Some(byte) => *byte ^= 0xff,
                None => corrupted.push(0),
            }
            return Ok(Bytes::from(corrupted));
        }

        Ok(data)
    }

    async fn delete(&self, namespace: &str, key: &str) -> TransportResult<()> {
        let faults = self.enter().await?;
        if faults.fail_delete {
            return Err(TransportError::Transport("injected delete failure".to_string()));
        }

        if let Some(ns) = self.namespaces.write().get_mut(namespace) {
            ns.remove(key);
        }
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn head(&self, namespace: &str, key: &str) -> TransportResult<bool> {
        self.enter().await?;
        Ok(self.blob(namespace, key).is_some())
    }

    async fn ensure_namespace(&self, namespace: &str) -> TransportResult<()> {
        self.enter().await?;
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default();
        Ok(())
    }

    async fn probe(&self) -> TransportResult<Duration> {
        self.enter().await?;
        Ok(Duration::from_micros(1))
    }
}

/// A set of in-memory nodes addressed by URL
#[derive(Default)]
pub struct MemoryCluster {
    nodes: RwLock<HashMap<String, Arc<MemoryNode>>>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the node at `url`, creating it on first use
    pub fn node(&self, url: &str) -> Arc<MemoryNode> {
        if let Some(node) = self.nodes.read().get(url) {
            return node.clone();
        }

        self.nodes
            .write()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::new()))
            .clone()
    }

    /// Total successful puts across all nodes
    pub fn total_puts(&self) -> u64 {
        self.nodes.read().values().map(|n| n.put_count()).sum()
    }

    /// Total successful deletes across all nodes
    pub fn total_deletes(&self) -> u64 {
        self.nodes.read().values().map(|n| n.delete_count()).sum()
    }
}

impl NodeConnector for MemoryCluster {
    fn transport(&self, node_url: &str) -> TransportResult<Arc<dyn NodeTransport>> {
        Ok(self.node(node_url))
    }
}
