//! Load rebalancer
//!
//! Moves replicas from nodes well above the average load to nodes well below
//! it. The band between `underload_factor * avg` and `overload_factor * avg`
//! is left alone so nodes near the mean are not shuffled back and forth
//! between runs.
//!
//! Load estimates are local to the pass: they start from the snapshot and
//! are adjusted after each move (or planned move), never re-read.

use chunkvault_metadata::{Chunk, MetadataRepository, Node, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::report::{ChunkRef, RunEvent, RunReport};
use crate::selection::is_eligible;
use crate::snapshot::NodeSnapshot;
use crate::transfer::{ChunkTransfer, ReleaseOutcome, SourcePolicy};

/// Rebalancer configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub overload_factor: f64,
    pub underload_factor: f64,
    pub dry_run: bool,
    pub respect_capacity: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            overload_factor: 1.3,
            underload_factor: 0.8,
            dry_run: false,
            respect_capacity: true,
        }
    }
}

/// Online nodes split around the average load
#[derive(Debug, Clone)]
pub struct LoadBands {
    pub avg_load: f64,
    /// Heaviest first
    pub overloaded: Vec<Node>,
    /// Lightest first
    pub underloaded: Vec<Node>,
}

impl LoadBands {
    /// Partition online nodes. Returns `None` when there are no online nodes.
    pub fn compute<'a>(
        online: impl IntoIterator<Item = &'a Node>,
        overload_factor: f64,
        underload_factor: f64,
    ) -> Option<Self> {
        let online: Vec<&Node> = online.into_iter().collect();
        if online.is_empty() {
            return None;
        }

        let avg_load = online.iter().map(|n| n.load() as f64).sum::<f64>() / online.len() as f64;

        let mut overloaded: Vec<Node> = online
            .iter()
            .filter(|n| n.load() as f64 > overload_factor * avg_load)
            .map(|n| (*n).clone())
            .collect();
        overloaded.sort_by(|a, b| b.load().cmp(&a.load()).then(a.id.cmp(&b.id)));

        let mut underloaded: Vec<Node> = online
            .iter()
            .filter(|n| (n.load() as f64) < underload_factor * avg_load)
            .map(|n| (*n).clone())
            .collect();
        underloaded.sort_by_key(|n| (n.load(), n.id));

        Some(Self {
            avg_load,
            overloaded,
            underloaded,
        })
    }

    /// Nothing to move
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty() || self.underloaded.is_empty()
    }
}

pub struct LoadRebalancer {
    repo: Arc<dyn MetadataRepository>,
    transfer: Arc<ChunkTransfer>,
    config: BalancerConfig,
}

impl LoadRebalancer {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        transfer: Arc<ChunkTransfer>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            repo,
            transfer,
            config,
        }
    }

    /// Run one rebalance pass.
    ///
    /// Per-node and per-chunk failures are reported; only repository
    /// failures outside a single node's scope fail the pass.
    #[instrument(skip_all, fields(dry_run = self.config.dry_run))]
    pub async fn run(&self, snapshot: &mut NodeSnapshot, report: &mut RunReport) -> Result<()> {
        let bands = match LoadBands::compute(
            snapshot.online(),
            self.config.overload_factor,
            self.config.underload_factor,
        ) {
            Some(bands) => bands,
            None => {
                report.summary.balanced = true;
                report.push(RunEvent::Balanced { avg_load: 0.0 });
                return Ok(());
            }
        };

        if bands.is_balanced() {
            info!(avg_load = bands.avg_load, "Load balanced, nothing to move");
            report.summary.balanced = true;
            report.push(RunEvent::Balanced {
                avg_load: bands.avg_load,
            });
            return Ok(());
        }

        info!(
            avg_load = bands.avg_load,
            overloaded = bands.overloaded.len(),
            underloaded = bands.underloaded.len(),
            "Rebalancing load"
        );

        let mut estimates: HashMap<Uuid, f64> = snapshot
            .online()
            .map(|n| (n.id, n.load() as f64))
            .collect();

        for source in &bands.overloaded {
            if estimate(&estimates, source.id) <= bands.avg_load {
                debug!(node = %source.url, "Already drained to average this pass");
                continue;
            }
            if let Err(e) = self
                .drain_node(source, &bands, &mut estimates, snapshot, report)
                .await
            {
                warn!(node = %source.url, error = %e, "Could not drain node");
                report.push(RunEvent::NodeSkipped {
                    node: source.url.clone(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Chunks on `node` that may be moved: at least two online replicas,
    /// smallest first. Returns each chunk with all of its holders.
    async fn movable_chunks(
        &self,
        node: &Node,
        snapshot: &NodeSnapshot,
    ) -> Result<Vec<(Chunk, HashSet<Uuid>)>> {
        let mut movable = Vec::new();
        for chunk in self.repo.node_chunks(node.id).await? {
            let holders: HashSet<Uuid> = self
                .repo
                .replica_nodes(chunk.id)
                .await?
                .into_iter()
                .map(|n| n.id)
                .collect();
            if snapshot.online_among(&holders).len() >= 2 {
                movable.push((chunk, holders));
            }
        }
        movable.sort_by_key(|(chunk, _)| chunk.size_bytes);
        Ok(movable)
    }

    #[instrument(skip_all, fields(node = %source.url))]
    async fn drain_node(
        &self,
        source: &Node,
        bands: &LoadBands,
        estimates: &mut HashMap<Uuid, f64>,
        snapshot: &mut NodeSnapshot,
        report: &mut RunReport,
    ) -> Result<()> {
        let avg = bands.avg_load;

        for (chunk, holders) in self.movable_chunks(source, snapshot).await? {
            if estimate(estimates, source.id) <= avg {
                break;
            }

            let chunk_ref = ChunkRef::from(&chunk);
            let target = bands.underloaded.iter().find(|n| {
                estimate(estimates, n.id) < avg
                    && is_eligible(
                        current(snapshot, n),
                        &holders,
                        chunk.size_bytes,
                        self.config.respect_capacity,
                    )
            });
            let Some(target) = target else {
                debug!(chunk_id = %chunk.id, "No underloaded node can take this chunk");
                report.summary.moves_skipped += 1;
                report.push(RunEvent::MoveSkipped {
                    chunk: chunk_ref,
                    from: source.url.clone(),
                    reason: "no available target".to_string(),
                });
                continue;
            };

            if self.config.dry_run {
                info!(chunk_id = %chunk.id, to = %target.url, "Dry run: move planned");
                adjust(estimates, source.id, -1.0);
                adjust(estimates, target.id, 1.0);
                report.summary.moves_planned += 1;
                report.push(RunEvent::MovePlanned {
                    chunk: chunk_ref,
                    from: source.url.clone(),
                    to: target.url.clone(),
                });
                continue;
            }

            let mut source_node = current(snapshot, source).clone();
            let mut target_node = current(snapshot, target).clone();

            let blob = match self
                .transfer
                .fetch_verified(
                    &chunk,
                    std::slice::from_ref(&source_node),
                    snapshot,
                    false,
                    report,
                )
                .await
            {
                Ok(blob) => blob,
                Err(e) => {
                    report.summary.moves_skipped += 1;
                    report.push(RunEvent::MoveSkipped {
                        chunk: chunk_ref,
                        from: source.url.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let result = self
                .transfer
                .replicate_to(
                    &chunk,
                    &blob,
                    &mut target_node,
                    SourcePolicy::Release(&mut source_node),
                )
                .await;

            match result {
                Ok(replication) if replication.linked => {
                    snapshot.update_counters(&target_node);
                    snapshot.update_counters(&source_node);
                    adjust(estimates, target.id, 1.0);

                    let source_released =
                        matches!(replication.release, ReleaseOutcome::Released { .. });
                    if source_released {
                        adjust(estimates, source.id, -1.0);
                    }

                    info!(
                        chunk_id = %chunk.id,
                        to = %target.url,
                        source_released,
                        "Chunk moved"
                    );
                    report.summary.moves_performed += 1;
                    report.push(RunEvent::MovePerformed {
                        chunk: chunk_ref,
                        from: source.url.clone(),
                        to: target.url.clone(),
                        source_released,
                    });
                    report.push_drift(chunk_ref, &replication.drift);
                }
                Ok(_) => {
                    report.summary.moves_skipped += 1;
                    report.push(RunEvent::MoveSkipped {
                        chunk: chunk_ref,
                        from: source.url.clone(),
                        reason: format!("{} already holds a replica", target.url),
                    });
                }
                Err(e) => {
                    warn!(chunk_id = %chunk.id, to = %target.url, error = %e, "Move failed");
                    report.summary.moves_skipped += 1;
                    report.push(RunEvent::MoveSkipped {
                        chunk: chunk_ref,
                        from: source.url.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// The snapshot's current record for `node`, with counters updated this run
fn current<'a>(snapshot: &'a NodeSnapshot, node: &'a Node) -> &'a Node {
    snapshot.get(&node.id).unwrap_or(node)
}

fn estimate(estimates: &HashMap<Uuid, f64>, node_id: Uuid) -> f64 {
    estimates.get(&node_id).copied().unwrap_or(0.0)
}

fn adjust(estimates: &mut HashMap<Uuid, f64>, node_id: Uuid, by: f64) {
    *estimates.entry(node_id).or_insert(0.0) += by;
}
