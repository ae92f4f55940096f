//! Run report
//!
//! Every per-chunk outcome of a run is recorded as a typed event; the binary
//! renders one line per event followed by the summary line.

use chunkvault_metadata::Chunk;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::transfer::CounterDrift;

/// Identifies a chunk in events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkRef {
    pub id: Uuid,
    pub file_id: Uuid,
    pub chunk_number: i32,
}

impl From<&Chunk> for ChunkRef {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id,
            file_id: chunk.file_id,
            chunk_number: chunk.chunk_number,
        }
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {} of file {}", self.chunk_number, self.file_id)
    }
}

/// How an event is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
}

/// One reportable outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    // ===== Repair =====
    /// No online node holds the chunk
    Unrecoverable { chunk: ChunkRef },
    /// Every online node already holds the chunk, or none has room
    NoTarget { chunk: ChunkRef, needed: usize },
    /// A source was skipped while fetching
    SourceRejected {
        chunk: ChunkRef,
        node: String,
        reason: String,
    },
    /// No source produced verified content
    FetchFailed { chunk: ChunkRef, reason: String },
    /// Dry run: what a repair would do
    RepairPlanned {
        chunk: ChunkRef,
        source: String,
        targets: Vec<String>,
    },
    ReplicaAdded { chunk: ChunkRef, node: String },
    /// The target gained the replica concurrently
    ReplicaAlreadyPresent { chunk: ChunkRef, node: String },
    StoreFailed {
        chunk: ChunkRef,
        node: String,
        reason: String,
    },
    /// Repair finished with `added` of `requested` replicas
    ChunkRepaired {
        chunk: ChunkRef,
        added: usize,
        requested: usize,
    },

    // ===== Rebalance =====
    /// No node is outside the load band
    Balanced { avg_load: f64 },
    /// Dry run: what a move would do
    MovePlanned {
        chunk: ChunkRef,
        from: String,
        to: String,
    },
    MovePerformed {
        chunk: ChunkRef,
        from: String,
        to: String,
        source_released: bool,
    },
    MoveSkipped {
        chunk: ChunkRef,
        from: String,
        reason: String,
    },
    /// A node could not be drained at all
    NodeSkipped { node: String, reason: String },

    // ===== Either pass =====
    /// A link change was recorded but the node's counters were not updated
    CounterDrift {
        chunk: ChunkRef,
        node: String,
        reason: String,
    },
}

impl RunEvent {
    pub fn level(&self) -> EventLevel {
        match self {
            Self::ReplicaAdded { .. } | Self::MovePerformed { .. } | Self::Balanced { .. } => {
                EventLevel::Success
            }
            Self::ChunkRepaired {
                added, requested, ..
            } if added >= requested => EventLevel::Success,
            Self::RepairPlanned { .. }
            | Self::MovePlanned { .. }
            | Self::ReplicaAlreadyPresent { .. } => EventLevel::Info,
            _ => EventLevel::Warning,
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecoverable { chunk } => {
                write!(f, "{}: no online replica, unrecoverable this run", chunk)
            }
            Self::NoTarget { chunk, needed } => {
                write!(f, "{}: no available target ({} needed)", chunk, needed)
            }
            Self::SourceRejected {
                chunk,
                node,
                reason,
            } => write!(f, "{}: skipped source {}: {}", chunk, node, reason),
            Self::FetchFailed { chunk, reason } => {
                write!(f, "{}: repair failed: {}", chunk, reason)
            }
            Self::RepairPlanned {
                chunk,
                source,
                targets,
            } => write!(
                f,
                "{}: would copy from {} to {}",
                chunk,
                source,
                targets.join(", ")
            ),
            Self::ReplicaAdded { chunk, node } => write!(f, "{}: replicated to {}", chunk, node),
            Self::ReplicaAlreadyPresent { chunk, node } => {
                write!(f, "{}: {} already holds a replica", chunk, node)
            }
            Self::StoreFailed {
                chunk,
                node,
                reason,
            } => write!(f, "{}: upload to {} failed: {}", chunk, node, reason),
            Self::ChunkRepaired {
                chunk,
                added,
                requested,
            } => write!(f, "{}: added {} of {} replicas", chunk, added, requested),
            Self::Balanced { avg_load } => {
                write!(f, "load balanced (average load {:.1})", avg_load)
            }
            Self::MovePlanned { chunk, from, to } => {
                write!(f, "{}: would move from {} to {}", chunk, from, to)
            }
            Self::MovePerformed {
                chunk,
                from,
                to,
                source_released,
            } => {
                if *source_released {
                    write!(f, "{}: moved from {} to {}", chunk, from, to)
                } else {
                    write!(f, "{}: copied from {} to {}, source kept", chunk, from, to)
                }
            }
            Self::MoveSkipped {
                chunk,
                from,
                reason,
            } => write!(f, "{}: move off {} skipped: {}", chunk, from, reason),
            Self::NodeSkipped { node, reason } => write!(f, "node {} skipped: {}", node, reason),
            Self::CounterDrift {
                chunk,
                node,
                reason,
            } => write!(
                f,
                "{}: counters of {} not updated, refresh metrics: {}",
                chunk, node, reason
            ),
        }
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub chunks_examined: usize,
    pub chunks_repaired: usize,
    pub chunks_skipped: usize,
    pub replicas_added: usize,
    pub replicas_planned: usize,
    pub moves_performed: usize,
    pub moves_planned: usize,
    pub moves_skipped: usize,
    pub balanced: bool,
}

impl RunSummary {
    /// Get summary string
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} chunks examined, {} repaired ({} replicas added), {} skipped; {} moves performed, {} skipped",
            self.chunks_examined,
            self.chunks_repaired,
            self.replicas_added,
            self.chunks_skipped,
            self.moves_performed,
            self.moves_skipped,
        );
        if self.replicas_planned > 0 || self.moves_planned > 0 {
            line.push_str(&format!(
                "; dry run planned {} replicas and {} moves",
                self.replicas_planned, self.moves_planned
            ));
        }
        if self.balanced {
            line.push_str("; balanced");
        }
        line
    }
}

/// Outcome of one coordinator run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub events: Vec<RunEvent>,
    pub summary: RunSummary,
    pub duration: Duration,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn push(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    /// Record counter updates lost after a committed link change
    pub fn push_drift(&mut self, chunk: ChunkRef, drift: &[CounterDrift]) {
        for d in drift {
            self.events.push(RunEvent::CounterDrift {
                chunk,
                node: d.node.clone(),
                reason: d.reason.clone(),
            });
        }
    }

    /// Events matching a predicate
    pub fn events_where<F>(&self, pred: F) -> Vec<&RunEvent>
    where
        F: Fn(&RunEvent) -> bool,
    {
        self.events.iter().filter(|e| pred(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> ChunkRef {
        ChunkRef {
            id: Uuid::from_u128(1),
            file_id: Uuid::from_u128(2),
            chunk_number: 3,
        }
    }

    #[test]
    fn test_summary_line() {
        let summary = RunSummary {
            chunks_examined: 4,
            chunks_repaired: 2,
            chunks_skipped: 2,
            replicas_added: 3,
            moves_performed: 1,
            ..Default::default()
        };
        assert_eq!(
            summary.summary(),
            "4 chunks examined, 2 repaired (3 replicas added), 2 skipped; 1 moves performed, 0 skipped"
        );
    }

    #[test]
    fn test_summary_mentions_balance_and_plan() {
        let summary = RunSummary {
            replicas_planned: 1,
            balanced: true,
            ..Default::default()
        };
        let line = summary.summary();
        assert!(line.contains("dry run planned 1 replicas"));
        assert!(line.ends_with("; balanced"));
    }

    #[test]
    fn test_event_levels() {
        let partial = RunEvent::ChunkRepaired {
            chunk: chunk(),
            added: 1,
            requested: 2,
        };
        assert_eq!(partial.level(), EventLevel::Warning);

        let full = RunEvent::ChunkRepaired {
            chunk: chunk(),
            added: 2,
            requested: 2,
        };
        assert_eq!(full.level(), EventLevel::Success);

        let missing = RunEvent::Unrecoverable { chunk: chunk() };
        assert_eq!(missing.level(), EventLevel::Warning);
        assert!(missing.to_string().contains("chunk 3 of file"));
    }

    #[test]
    fn test_counter_drift_is_a_warning() {
        let mut report = RunReport::new(false);
        report.push_drift(
            chunk(),
            &[CounterDrift {
                node: "http://node-b:9000".to_string(),
                reason: "locked".to_string(),
            }],
        );
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].level(), EventLevel::Warning);
        let line = report.events[0].to_string();
        assert!(line.contains("node-b"));
        assert!(line.contains("refresh metrics"));
    }

    #[test]
    fn test_report_serializes_tagged_events() {
        let mut report = RunReport::new(false);
        report.push(RunEvent::ReplicaAdded {
            chunk: chunk(),
            node: "http://node-a:9000".to_string(),
        });
        report.summary.replicas_added = 1;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["events"][0]["event"], "replica_added");
        assert_eq!(json["events"][0]["chunk"]["chunk_number"], 3);
        assert_eq!(json["summary"]["replicas_added"], 1);
    }
}
