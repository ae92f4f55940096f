//! ChunkVault Rebalancer Library
//!
//! Keeps chunk replicas at their floor and node load even:
//! - Detection of chunks below `min_replicas` online replicas
//! - Repair (copy verified content onto the least-loaded eligible nodes)
//! - Rebalancing (move replicas from overloaded to underloaded nodes)
//! - Node counter refresh from the replica links
//!
//! # Usage
//!
//! ```ignore
//! use chunkvault_rebalancer::{RebalancerConfig, RunCoordinator};
//!
//! let coordinator = RunCoordinator::new(repo, connector, RebalancerConfig::default());
//! let report = coordinator.run().await?;
//! println!("{}", report.summary.summary());
//! ```

pub mod balancer;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod metrics;
pub mod repair;
pub mod report;
pub mod selection;
pub mod snapshot;
pub mod transfer;

// Re-export main types
pub use balancer::{BalancerConfig, LoadBands, LoadRebalancer};
pub use config::{ConfigError, RebalancerConfig};
pub use coordinator::{CoordinatorError, RunCoordinator};
pub use detector::{ChunkHealth, ChunkIssue, Detector, ScanResult};
pub use metrics::{refresh_node_metrics, NodeMetrics};
pub use repair::{RepairConfig, RepairEngine};
pub use report::{ChunkRef, EventLevel, RunEvent, RunReport, RunSummary};
pub use selection::{is_eligible, select_targets};
pub use snapshot::NodeSnapshot;
pub use transfer::{
    ChunkTransfer, CounterDrift, Phase, ReleaseOutcome, Replication, SourcePolicy, TransferConfig,
    TransferError, VerifiedBlob,
};
