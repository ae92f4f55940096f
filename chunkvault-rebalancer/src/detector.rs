//! Under-replication detector
//!
//! Finds chunks whose count of online replicas is below the floor and
//! classifies each one against the run's node snapshot.

use chunkvault_metadata::{Chunk, MetadataRepository, Node, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::snapshot::NodeSnapshot;

/// Replica state of one chunk
#[derive(Debug, Clone)]
pub struct ChunkHealth {
    /// Every node linked to the chunk, online or not
    pub holders: HashSet<Uuid>,
    /// Online holders, by load then id
    pub online: Vec<Node>,
}

impl ChunkHealth {
    /// Replicas still missing to reach `min_replicas`
    pub fn deficit(&self, min_replicas: usize) -> usize {
        min_replicas.saturating_sub(self.online.len())
    }

    /// No online node holds the chunk
    pub fn is_unrecoverable(&self) -> bool {
        self.online.is_empty()
    }
}

/// A chunk below the floor when the scan ran
#[derive(Debug, Clone)]
pub struct ChunkIssue {
    pub chunk: Chunk,
    pub health: ChunkHealth,
}

/// Scan results, in file order
#[derive(Debug, Default)]
pub struct ScanResult {
    pub under_replicated: Vec<ChunkIssue>,
}

impl ScanResult {
    /// Issues with no online replica left
    pub fn unrecoverable(&self) -> impl Iterator<Item = &ChunkIssue> {
        self.under_replicated
            .iter()
            .filter(|issue| issue.health.is_unrecoverable())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} under-replicated ({} unrecoverable)",
            self.under_replicated.len(),
            self.unrecoverable().count()
        )
    }
}

pub struct Detector {
    repo: Arc<dyn MetadataRepository>,
    min_replicas: usize,
}

impl Detector {
    pub fn new(repo: Arc<dyn MetadataRepository>, min_replicas: usize) -> Self {
        Self { repo, min_replicas }
    }

    pub fn min_replicas(&self) -> usize {
        self.min_replicas
    }

    /// Read a chunk's live replica links against the snapshot's liveness
    pub async fn assess(&self, chunk: &Chunk, snapshot: &NodeSnapshot) -> Result<ChunkHealth> {
        let holders: HashSet<Uuid> = self
            .repo
            .replica_nodes(chunk.id)
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();
        let online = snapshot.online_among(&holders);
        Ok(ChunkHealth { holders, online })
    }

    /// Find every chunk below the floor
    #[instrument(skip_all, fields(min_replicas = self.min_replicas))]
    pub async fn scan(&self, snapshot: &NodeSnapshot) -> Result<ScanResult> {
        let mut result = ScanResult::default();

        for chunk in self.repo.under_replicated_chunks(self.min_replicas).await? {
            let health = self.assess(&chunk, snapshot).await?;
            if health.deficit(self.min_replicas) == 0 {
                // Repository and snapshot disagree on liveness; trust the snapshot
                debug!(chunk_id = %chunk.id, "Chunk meets the floor in this snapshot");
                continue;
            }
            result.under_replicated.push(ChunkIssue { chunk, health });
        }

        info!(summary = %result.summary(), "Scan complete");
        Ok(result)
    }
}
