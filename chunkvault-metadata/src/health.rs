//! Node liveness probing
//!
//! The replication engine only reads `Node::status`; this module is what
//! refreshes it. Each node is probed through its transport with a bounded
//! timeout and the outcome is persisted:
//! - success resets the failure streak and brings an offline node back
//!   online (stamping `recovered_at`)
//! - failure extends the streak and takes an online node offline once the
//!   streak reaches `failure_threshold` (stamping `failed_at`)

use crate::models::{Node, NodeHealthUpdate, NodeStatus};
use crate::repository::{MetadataRepository, Result};
use chrono::{DateTime, Utc};
use chunkvault_storage::{NodeConnector, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Timeout for a single probe
    pub check_timeout: Duration,
    /// Consecutive failures before an online node is marked offline
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            failure_threshold: 1,
        }
    }
}

/// Result of probing one node
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub node_url: String,
    pub previous: NodeStatus,
    pub status: NodeStatus,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: i32,
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Node went from online to offline
    pub fn went_offline(&self) -> bool {
        self.previous == NodeStatus::Online && self.status == NodeStatus::Offline
    }

    /// Node went from offline to online
    pub fn recovered(&self) -> bool {
        self.previous == NodeStatus::Offline && self.status == NodeStatus::Online
    }
}

/// Compute the record update for one probe outcome
pub fn evaluate_probe(
    node: &Node,
    outcome: &std::result::Result<Duration, TransportError>,
    failure_threshold: u32,
    now: DateTime<Utc>,
) -> NodeHealthUpdate {
    match outcome {
        Ok(latency) => {
            let recovered_at = if node.is_online() {
                node.recovered_at
            } else {
                Some(now)
            };
            NodeHealthUpdate {
                status: NodeStatus::Online,
                checked_at: now,
                latency_ms: Some(latency.as_micros() as f64 / 1000.0),
                consecutive_failures: 0,
                failed_at: node.failed_at,
                recovered_at,
            }
        }
        Err(_) => {
            let failures = node.consecutive_failures.saturating_add(1);
            let trip = failures >= failure_threshold.max(1) as i32;
            let (status, failed_at) = if node.is_online() && trip {
                (NodeStatus::Offline, Some(now))
            } else {
                (node.status, node.failed_at)
            };
            NodeHealthUpdate {
                status,
                checked_at: now,
                latency_ms: None,
                consecutive_failures: failures,
                failed_at,
                recovered_at: node.recovered_at,
            }
        }
    }
}

/// Probes every node and persists liveness
pub struct HealthProbe {
    repo: Arc<dyn MetadataRepository>,
    connector: Arc<dyn NodeConnector>,
    config: HealthConfig,
}

impl HealthProbe {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        connector: Arc<dyn NodeConnector>,
        config: HealthConfig,
    ) -> Self {
        Self {
            repo,
            connector,
            config,
        }
    }

    /// Probe a single node and persist the outcome
    pub async fn check_node(&self, node: &Node) -> Result<HealthCheckResult> {
        let outcome = match self.connector.transport(&node.url) {
            Ok(transport) => {
                match tokio::time::timeout(self.config.check_timeout, transport.probe()).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(self.config.check_timeout)),
                }
            }
            Err(e) => Err(e),
        };

        let update = evaluate_probe(node, &outcome, self.config.failure_threshold, Utc::now());
        let updated = self.repo.record_node_health(node.id, &update).await?;

        let result = HealthCheckResult {
            node_url: node.url.clone(),
            previous: node.status,
            status: updated.status,
            latency_ms: update.latency_ms,
            consecutive_failures: updated.consecutive_failures,
            error: outcome.err().map(|e| e.to_string()),
        };

        if result.went_offline() {
            warn!(node = %node.url, error = ?result.error, "Node marked offline");
        } else if result.recovered() {
            info!(node = %node.url, "Node back online");
        } else {
            debug!(
                node = %node.url,
                status = %result.status,
                latency_ms = ?result.latency_ms,
                "Health check completed"
            );
        }

        Ok(result)
    }

    /// Probe all nodes concurrently
    pub async fn check_all(&self) -> Result<HealthSummary> {
        let nodes = self.repo.list_nodes().await?;
        let checks = nodes.iter().map(|node| self.check_node(node));
        let results = futures::future::join_all(checks)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let summary = HealthSummary::from_results(&results);
        info!(
            online = summary.online,
            total = summary.total,
            "Health check cycle completed"
        );
        Ok(summary)
    }
}

/// Health summary statistics
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    pub total: usize,
    pub online: usize,
    pub went_offline: usize,
    pub recovered: usize,
    pub avg_latency_ms: Option<f64>,
    pub results: Vec<HealthCheckResult>,
}

impl HealthSummary {
    fn from_results(results: &[HealthCheckResult]) -> Self {
        let latencies: Vec<f64> = results.iter().filter_map(|r| r.latency_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Self {
            total: results.len(),
            online: results
                .iter()
                .filter(|r| r.status == NodeStatus::Online)
                .count(),
            went_offline: results.iter().filter(|r| r.went_offline()).count(),
            recovered: results.iter().filter(|r| r.recovered()).count(),
            avg_latency_ms,
            results: results.to_vec(),
        }
    }

    /// Share of nodes online, 0-100
    pub fn online_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.online as f64 / self.total as f64 * 100.0
    }
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} nodes online ({:.1}%)",
            self.online,
            self.total,
            self.online_percent()
        )
    }
}
