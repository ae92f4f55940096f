//! Node counter refresh
//!
//! Recomputes each online node's `load` (hosted replicas) and
//! `storage_usage` (bytes of hosted chunks) from the replica links, undoing
//! any drift left by interrupted runs.

use chunkvault_metadata::{MetadataRepository, Result};
use tracing::{info, instrument};
use uuid::Uuid;

/// Recomputed counters for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetrics {
    pub node_id: Uuid,
    pub url: String,
    pub load: i64,
    pub storage_usage: i64,
    /// Counters differed from the stored ones
    pub corrected: bool,
}

/// Recompute and persist counters for every online node
#[instrument(skip_all)]
pub async fn refresh_node_metrics(repo: &dyn MetadataRepository) -> Result<Vec<NodeMetrics>> {
    let mut refreshed = Vec::new();

    for node in repo.list_nodes().await?.into_iter().filter(|n| n.is_online()) {
        let chunks = repo.node_chunks(node.id).await?;
        let load = chunks.len() as i64;
        let storage_usage: i64 = chunks.iter().map(|c| c.size_bytes).sum();
        let corrected = node.load() != load || node.storage_usage() != storage_usage;

        if corrected {
            repo.set_node_counters(node.id, load, storage_usage).await?;
            info!(
                node = %node.url,
                load,
                storage_usage,
                previous_load = node.load(),
                previous_storage = node.storage_usage(),
                "Node counters corrected"
            );
        }

        refreshed.push(NodeMetrics {
            node_id: node.id,
            url: node.url,
            load,
            storage_usage,
            corrected,
        });
    }

    Ok(refreshed)
}
