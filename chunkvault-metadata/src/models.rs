//! Data model for ChunkVault metadata
//!
//! These structs map directly to PostgreSQL tables. `Node` is an aggregate:
//! its counters only change through the replica accounting methods, which
//! hand back the delta the repository must persist.

use chrono::{DateTime, Utc};
use chunkvault_core::{Checksum, ObjectKey};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Default node capacity (1 TiB)
pub const DEFAULT_NODE_CAPACITY: i64 = 1024 * 1024 * 1024 * 1024;

/// Node status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Offline
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Logical user object
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct File {
    pub id: Uuid,
    pub name: String,
    pub size_bytes: i64,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One slice of a file
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub file_id: Uuid,
    /// Position within the file, fixed at creation
    pub chunk_number: i32,
    pub size_bytes: i64,
    /// Lowercase hex SHA-256 of the plaintext content
    pub checksum: String,
    /// Blob is stored under its checksum instead of its position
    pub content_addressed: bool,
}

impl Chunk {
    /// Recorded checksum, if well-formed
    pub fn parsed_checksum(&self) -> Option<Checksum> {
        Checksum::from_hex(&self.checksum).ok()
    }

    /// Key of this chunk's blob on every replica node.
    ///
    /// A content-addressed chunk with a malformed checksum falls back to the
    /// positional key; its content can never verify anyway.
    pub fn object_key(&self) -> ObjectKey {
        if self.content_addressed {
            if let Some(checksum) = self.parsed_checksum() {
                return ObjectKey::ContentAddressed(checksum);
            }
        }
        ObjectKey::Positional {
            file_id: self.file_id,
            chunk_number: self.chunk_number.max(0) as u32,
        }
    }
}

/// Signed change to a node's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub load: i64,
    pub storage_bytes: i64,
}

impl CounterDelta {
    /// Delta for one replica of `size_bytes` landing on a node
    pub fn added(size_bytes: i64) -> Self {
        Self {
            load: 1,
            storage_bytes: size_bytes,
        }
    }

    /// Delta for one replica of `size_bytes` leaving a node
    pub fn removed(size_bytes: i64) -> Self {
        Self {
            load: -1,
            storage_bytes: -size_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.load == 0 && self.storage_bytes == 0
    }
}

/// Storage node
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub url: String,
    pub status: NodeStatus,
    load: i64,
    storage_usage: i64,
    pub capacity: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub consecutive_failures: i32,
    pub failed_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl Node {
    /// A fresh online node with zeroed counters
    pub fn new(id: Uuid, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            status: NodeStatus::Online,
            load: 0,
            storage_usage: 0,
            capacity: DEFAULT_NODE_CAPACITY,
            last_check: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            failed_at: None,
            recovered_at: None,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_load(mut self, load: i64) -> Self {
        self.load = load;
        self
    }

    pub fn with_storage_usage(mut self, storage_usage: i64) -> Self {
        self.storage_usage = storage_usage;
        self
    }

    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// Relative load signal (hosted replicas)
    pub fn load(&self) -> i64 {
        self.load
    }

    /// Bytes currently held
    pub fn storage_usage(&self) -> i64 {
        self.storage_usage
    }

    /// Remaining bytes before the node is full (never negative)
    pub fn available_capacity(&self) -> i64 {
        (self.capacity - self.storage_usage).max(0)
    }

    /// Whether a blob of `size_bytes` still fits
    pub fn has_room_for(&self, size_bytes: i64) -> bool {
        self.available_capacity() >= size_bytes
    }

    /// Account for a replica stored on this node.
    ///
    /// Call only after the blob write is confirmed and the replica link is
    /// recorded; persist the returned delta.
    pub fn record_replica_added(&mut self, size_bytes: i64) -> CounterDelta {
        let delta = CounterDelta::added(size_bytes);
        self.apply(delta);
        delta
    }

    /// Account for a replica released from this node.
    ///
    /// Call only after the replica link is removed; persist the returned delta.
    pub fn record_replica_removed(&mut self, size_bytes: i64) -> CounterDelta {
        let delta = CounterDelta::removed(size_bytes);
        self.apply(delta);
        delta
    }

    /// Apply a delta already persisted elsewhere. Counters floor at zero.
    pub fn apply(&mut self, delta: CounterDelta) {
        self.load = (self.load + delta.load).max(0);
        self.storage_usage = (self.storage_usage + delta.storage_bytes).max(0);
    }

    /// Overwrite counters with recomputed values
    pub fn reset_counters(&mut self, load: i64, storage_usage: i64) {
        self.load = load.max(0);
        self.storage_usage = storage_usage.max(0);
    }
}

/// Chunk to node membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRow, Serialize, Deserialize)]
pub struct Replica {
    pub chunk_id: Uuid,
    pub node_id: Uuid,
}

/// Outcome of one liveness probe, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct NodeHealthUpdate {
    pub status: NodeStatus,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: i32,
    pub failed_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Apply a persisted health update to this record
    pub fn apply_health(&mut self, update: &NodeHealthUpdate) {
        self.status = update.status;
        self.last_check = Some(update.checked_at);
        if update.latency_ms.is_some() {
            self.last_latency_ms = update.latency_ms;
        }
        self.consecutive_failures = update.consecutive_failures;
        self.failed_at = update.failed_at;
        self.recovered_at = update.recovered_at;
    }
}
