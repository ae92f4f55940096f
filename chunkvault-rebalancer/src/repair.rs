//! Replica repair engine
//!
//! Brings every chunk with fewer than `min_replicas` online replicas back up
//! to the floor. Chunks are handled one at a time in file order; a failure on
//! one chunk is reported and never stops the pass.

use chunkvault_metadata::{Chunk, MetadataRepository, Node, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::detector::Detector;
use crate::report::{ChunkRef, RunEvent, RunReport};
use crate::selection::select_targets;
use crate::snapshot::NodeSnapshot;
use crate::transfer::{ChunkTransfer, SourcePolicy, TransferError};

/// Repair engine configuration
#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub min_replicas: usize,
    pub dry_run: bool,
    pub respect_capacity: bool,
}

enum ChunkOutcome {
    /// At least one replica added
    Repaired,
    /// Dry run
    Planned,
    Skipped,
}

pub struct RepairEngine {
    detector: Detector,
    transfer: Arc<ChunkTransfer>,
    config: RepairConfig,
}

impl RepairEngine {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        transfer: Arc<ChunkTransfer>,
        config: RepairConfig,
    ) -> Self {
        Self {
            detector: Detector::new(repo, config.min_replicas),
            transfer,
            config,
        }
    }

    /// Run one repair pass.
    ///
    /// Only the initial scan can fail the pass.
    #[instrument(skip_all, fields(min_replicas = self.config.min_replicas, dry_run = self.config.dry_run))]
    pub async fn run(&self, snapshot: &mut NodeSnapshot, report: &mut RunReport) -> Result<()> {
        let scan = self.detector.scan(snapshot).await?;

        if scan.under_replicated.is_empty() {
            info!("All chunks meet the replication floor");
            return Ok(());
        }
        info!(count = scan.under_replicated.len(), "Repairing under-replicated chunks");

        for chunk in scan.under_replicated.iter().map(|issue| &issue.chunk) {
            report.summary.chunks_examined += 1;
            match self.repair_chunk(chunk, snapshot, report).await {
                Ok(ChunkOutcome::Repaired) => report.summary.chunks_repaired += 1,
                Ok(ChunkOutcome::Planned) => {}
                Ok(ChunkOutcome::Skipped) => report.summary.chunks_skipped += 1,
                Err(e) => {
                    warn!(chunk_id = %chunk.id, error = %e, "Chunk repair failed");
                    report.push(RunEvent::FetchFailed {
                        chunk: ChunkRef::from(chunk),
                        reason: e.to_string(),
                    });
                    report.summary.chunks_skipped += 1;
                }
            }
        }

        Ok(())
    }

    /// Repair one chunk
    #[instrument(
        skip_all,
        fields(chunk_id = %chunk.id, file_id = %chunk.file_id, chunk_number = chunk.chunk_number)
    )]
    async fn repair_chunk(
        &self,
        chunk: &Chunk,
        snapshot: &mut NodeSnapshot,
        report: &mut RunReport,
    ) -> std::result::Result<ChunkOutcome, TransferError> {
        let chunk_ref = ChunkRef::from(chunk);
        // Earlier chunks in this run may have changed the replica set
        let health = self.detector.assess(chunk, snapshot).await?;

        let need = health.deficit(self.config.min_replicas);
        if need == 0 {
            debug!("Chunk reached the floor since the scan");
            return Ok(ChunkOutcome::Skipped);
        }

        if health.is_unrecoverable() {
            warn!("No online replica, chunk unrecoverable this run");
            report.push(RunEvent::Unrecoverable { chunk: chunk_ref });
            return Ok(ChunkOutcome::Skipped);
        }

        let targets: Vec<Node> = select_targets(
            need,
            &health.holders,
            snapshot.online(),
            chunk.size_bytes,
            self.config.respect_capacity,
        )
        .into_iter()
        .cloned()
        .collect();

        if targets.is_empty() {
            warn!(needed = need, "No available target");
            report.push(RunEvent::NoTarget {
                chunk: chunk_ref,
                needed: need,
            });
            return Ok(ChunkOutcome::Skipped);
        }
        if targets.len() < need {
            warn!(needed = need, available = targets.len(), "Fewer targets than needed");
        }

        let blob = match self
            .transfer
            .fetch_verified(chunk, &health.online, snapshot, true, report)
            .await
        {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "No verified source, chunk left under-replicated");
                report.push(RunEvent::FetchFailed {
                    chunk: chunk_ref,
                    reason: e.to_string(),
                });
                return Ok(ChunkOutcome::Skipped);
            }
        };

        if self.config.dry_run {
            info!(source = %blob.source_url, targets = targets.len(), "Dry run: repair planned");
            // Later chunks and the rebalance pass plan against these loads
            for target in &targets {
                let mut planned = target.clone();
                planned.record_replica_added(chunk.size_bytes);
                snapshot.update_counters(&planned);
            }
            report.summary.replicas_planned += targets.len();
            report.push(RunEvent::RepairPlanned {
                chunk: chunk_ref,
                source: blob.source_url.clone(),
                targets: targets.iter().map(|n| n.url.clone()).collect(),
            });
            return Ok(ChunkOutcome::Planned);
        }

        let mut added = 0;
        for mut target in targets {
            match self
                .transfer
                .replicate_to(chunk, &blob, &mut target, SourcePolicy::Retain)
                .await
            {
                Ok(replication) if replication.linked => {
                    snapshot.update_counters(&target);
                    added += 1;
                    report.summary.replicas_added += 1;
                    info!(node = %target.url, "Replica added");
                    report.push(RunEvent::ReplicaAdded {
                        chunk: chunk_ref,
                        node: target.url.clone(),
                    });
                    report.push_drift(chunk_ref, &replication.drift);
                }
                Ok(_) => {
                    report.push(RunEvent::ReplicaAlreadyPresent {
                        chunk: chunk_ref,
                        node: target.url.clone(),
                    });
                }
                Err(e) => {
                    warn!(node = %target.url, error = %e, "Upload to target failed");
                    report.push(RunEvent::StoreFailed {
                        chunk: chunk_ref,
                        node: target.url.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.push(RunEvent::ChunkRepaired {
            chunk: chunk_ref,
            added,
            requested: need,
        });
        Ok(if added > 0 {
            ChunkOutcome::Repaired
        } else {
            ChunkOutcome::Skipped
        })
    }
}
