//! Run coordinator
//!
//! One run: optional counter refresh, a node snapshot, the repair pass, then
//! the rebalance pass when requested. Per-chunk failures land in the report;
//! the run itself fails only when it cannot start.

use chunkvault_metadata::{MetadataError, MetadataRepository};
use chunkvault_storage::NodeConnector;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument};

use crate::balancer::{BalancerConfig, LoadRebalancer};
use crate::config::RebalancerConfig;
use crate::metrics::refresh_node_metrics;
use crate::repair::{RepairConfig, RepairEngine};
use crate::report::RunReport;
use crate::snapshot::NodeSnapshot;
use crate::transfer::{ChunkTransfer, TransferConfig};

/// Errors that abort a run
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("No online nodes")]
    NoOnlineNodes,

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

pub struct RunCoordinator {
    repo: Arc<dyn MetadataRepository>,
    connector: Arc<dyn NodeConnector>,
    config: RebalancerConfig,
}

impl RunCoordinator {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        connector: Arc<dyn NodeConnector>,
        config: RebalancerConfig,
    ) -> Self {
        Self {
            repo,
            connector,
            config,
        }
    }

    pub fn config(&self) -> &RebalancerConfig {
        &self.config
    }

    /// Execute one run
    #[instrument(
        skip_all,
        fields(
            min_replicas = self.config.min_replicas,
            balance_load = self.config.balance_load,
            dry_run = self.config.dry_run
        )
    )]
    pub async fn run(&self) -> Result<RunReport, CoordinatorError> {
        let started = Instant::now();
        let mut report = RunReport::new(self.config.dry_run);

        if self.config.refresh_metrics && !self.config.dry_run {
            let refreshed = refresh_node_metrics(self.repo.as_ref()).await?;
            let corrected = refreshed.iter().filter(|m| m.corrected).count();
            info!(nodes = refreshed.len(), corrected, "Node counters refreshed");
        }

        let mut snapshot = NodeSnapshot::load(self.repo.as_ref()).await?;
        let online = snapshot.online_count();
        if online == 0 {
            return Err(CoordinatorError::NoOnlineNodes);
        }
        info!(nodes = snapshot.len(), online, "Node snapshot loaded");

        let transfer = Arc::new(ChunkTransfer::new(
            self.repo.clone(),
            self.connector.clone(),
            TransferConfig {
                namespace: self.config.namespace.clone(),
                timeout: self.config.transport_timeout(),
                use_dedup_sources: self.config.use_dedup_sources,
            },
        ));

        let repair = RepairEngine::new(
            self.repo.clone(),
            transfer.clone(),
            RepairConfig {
                min_replicas: self.config.min_replicas,
                dry_run: self.config.dry_run,
                respect_capacity: self.config.respect_capacity,
            },
        );
        repair.run(&mut snapshot, &mut report).await?;

        if self.config.balance_load {
            let balancer = LoadRebalancer::new(
                self.repo.clone(),
                transfer,
                BalancerConfig {
                    overload_factor: self.config.overload_factor,
                    underload_factor: self.config.underload_factor,
                    dry_run: self.config.dry_run,
                    respect_capacity: self.config.respect_capacity,
                },
            );
            balancer.run(&mut snapshot, &mut report).await?;
        }

        report.duration = started.elapsed();
        info!(
            duration_ms = report.duration.as_millis() as u64,
            summary = %report.summary.summary(),
            "Run complete"
        );
        Ok(report)
    }
}
