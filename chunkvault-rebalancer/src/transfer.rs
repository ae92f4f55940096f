//! Replicate-chunk-to-node primitive
//!
//! Both repair and rebalance move data the same way:
//!
//! 1. fetch the blob from a source and check it against the recorded checksum
//! 2. store it on the target (creating the namespace if needed)
//! 3. read it back from the target and check it again
//! 4. record the replica link, then the target's counters
//! 5. for a move, release the source: drop its link, then its counters,
//!    then its blob
//!
//! A link is never recorded before the target confirmed the write, and a
//! source is never released before the target's link exists. Every node call
//! is bounded by the configured timeout; a timeout is handled like any other
//! transport failure.
//!
//! Once a link change is recorded it stands. A counter update that fails
//! afterwards is returned as [`CounterDrift`] alongside the committed
//! outcome; a metrics refresh corrects the stored counters later.

use bytes::Bytes;
use chunkvault_core::{verify_checksum, Checksum, ObjectKey};
use chunkvault_metadata::{Chunk, CounterDelta, MetadataError, MetadataRepository, Node};
use chunkvault_storage::{NodeConnector, NodeTransport, TransportError, TransportResult};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::report::{ChunkRef, RunEvent, RunReport};
use crate::snapshot::NodeSnapshot;

/// Step of a transfer, for logs and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Store,
    Verify,
    Commit,
    Release,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Store => write!(f, "store"),
            Self::Verify => write!(f, "verify"),
            Self::Commit => write!(f, "commit"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No source yielded verified content")]
    Unrecoverable,

    #[error("Checksum mismatch on {node} during {phase}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        node: String,
        phase: Phase,
        expected: String,
        actual: String,
    },

    #[error("Transport error on {node} during {phase}: {source}")]
    Transport {
        node: String,
        phase: Phase,
        #[source]
        source: TransportError,
    },

    #[error("Timed out after {after:?} on {node} during {phase}")]
    Timeout {
        node: String,
        phase: Phase,
        after: Duration,
    },

    #[error("No available target")]
    NoTarget,

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bucket holding chunk blobs on every node
    pub namespace: String,
    /// Bound on each node call
    pub timeout: Duration,
    /// Fall back to deduplicated copies when no own replica verifies
    pub use_dedup_sources: bool,
}

/// Content that passed the checksum gate
#[derive(Debug, Clone)]
pub struct VerifiedBlob {
    pub data: Bytes,
    pub source_id: Uuid,
    pub source_url: String,
    /// Fetched under another chunk's key
    pub deduplicated: bool,
}

/// What happens to the source replica after the target is committed
pub enum SourcePolicy<'a> {
    Retain,
    Release(&'a mut Node),
}

/// Fate of the source replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Release was not requested
    Retained,
    /// Link removed and counters decremented
    Released { blob_deleted: bool },
    /// Release was requested but no other online replica remained
    Kept,
}

/// A recorded link change whose node counters were not persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDrift {
    pub node: String,
    pub reason: String,
}

/// Outcome of [`ChunkTransfer::replicate_to`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replication {
    /// False when the target already held a link
    pub linked: bool,
    pub release: ReleaseOutcome,
    pub drift: Vec<CounterDrift>,
}

/// Moves verified chunk content between nodes and records it
pub struct ChunkTransfer {
    repo: Arc<dyn MetadataRepository>,
    connector: Arc<dyn NodeConnector>,
    config: TransferConfig,
}

impl ChunkTransfer {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        connector: Arc<dyn NodeConnector>,
        config: TransferConfig,
    ) -> Self {
        Self {
            repo,
            connector,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn transport_for(&self, node: &Node, phase: Phase) -> Result<Arc<dyn NodeTransport>> {
        self.connector
            .transport(&node.url)
            .map_err(|source| TransferError::Transport {
                node: node.url.clone(),
                phase,
                source,
            })
    }

    /// Run one node call under the timeout
    async fn call<T, F>(&self, node: &Node, phase: Phase, fut: F) -> Result<T>
    where
        F: Future<Output = TransportResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(TransportError::Timeout(after))) => Err(TransferError::Timeout {
                node: node.url.clone(),
                phase,
                after,
            }),
            Ok(Err(source)) => Err(TransferError::Transport {
                node: node.url.clone(),
                phase,
                source,
            }),
            Err(_) => Err(TransferError::Timeout {
                node: node.url.clone(),
                phase,
                after: self.config.timeout,
            }),
        }
    }

    /// Download `key` from `node` and check it against the chunk's checksum
    async fn fetch_from(
        &self,
        chunk: &Chunk,
        key: &ObjectKey,
        node: &Node,
        phase: Phase,
    ) -> Result<Bytes> {
        let transport = self.transport_for(node, phase)?;
        let path = key.as_path();
        let data = self
            .call(node, phase, transport.get(&self.config.namespace, &path))
            .await?;

        if !verify_checksum(&data, &chunk.checksum) {
            return Err(TransferError::ChecksumMismatch {
                node: node.url.clone(),
                phase,
                expected: chunk.checksum.clone(),
                actual: Checksum::compute(&data).to_hex(),
            });
        }
        Ok(data)
    }

    /// Fetch phase.
    ///
    /// Tries `sources` in order, then (when enabled and `allow_dedup`)
    /// online holders of deduplicated copies. The first content that passes
    /// the checksum gate wins; every rejected source is reported and left
    /// untouched.
    #[instrument(
        skip_all,
        fields(chunk_id = %chunk.id, file_id = %chunk.file_id, chunk_number = chunk.chunk_number)
    )]
    pub async fn fetch_verified(
        &self,
        chunk: &Chunk,
        sources: &[Node],
        snapshot: &NodeSnapshot,
        allow_dedup: bool,
        report: &mut RunReport,
    ) -> Result<VerifiedBlob> {
        let key = chunk.object_key();
        let mut tried: HashSet<(ObjectKey, Uuid)> = HashSet::new();

        for node in sources {
            tried.insert((key, node.id));
            match self.fetch_from(chunk, &key, node, Phase::Fetch).await {
                Ok(data) => {
                    debug!(node = %node.url, size = data.len(), "Fetched verified content");
                    return Ok(VerifiedBlob {
                        data,
                        source_id: node.id,
                        source_url: node.url.clone(),
                        deduplicated: false,
                    });
                }
                Err(e) => self.reject_source(chunk, node, &e, report),
            }
        }

        if allow_dedup && self.config.use_dedup_sources {
            for (alt_key, node) in self.dedup_sources(chunk, snapshot).await? {
                if !tried.insert((alt_key, node.id)) {
                    continue;
                }
                match self.fetch_from(chunk, &alt_key, &node, Phase::Fetch).await {
                    Ok(data) => {
                        info!(node = %node.url, key = %alt_key, "Recovered content from deduplicated copy");
                        return Ok(VerifiedBlob {
                            data,
                            source_id: node.id,
                            source_url: node.url.clone(),
                            deduplicated: true,
                        });
                    }
                    Err(e) => self.reject_source(chunk, &node, &e, report),
                }
            }
        }

        Err(TransferError::Unrecoverable)
    }

    fn reject_source(&self, chunk: &Chunk, node: &Node, err: &TransferError, report: &mut RunReport) {
        warn!(
            chunk_id = %chunk.id,
            node = %node.url,
            phase = %Phase::Fetch,
            error = %err,
            "Source skipped"
        );
        report.push(RunEvent::SourceRejected {
            chunk: ChunkRef::from(chunk),
            node: node.url.clone(),
            reason: err.to_string(),
        });
    }

    /// Online holders of other chunks with identical content
    async fn dedup_sources(
        &self,
        chunk: &Chunk,
        snapshot: &NodeSnapshot,
    ) -> Result<Vec<(ObjectKey, Node)>> {
        let mut sources = Vec::new();
        let twins = self
            .repo
            .chunks_with_checksum(&chunk.checksum, chunk.size_bytes)
            .await?;

        for twin in twins.iter().filter(|c| c.id != chunk.id) {
            let holders: HashSet<Uuid> = self
                .repo
                .replica_nodes(twin.id)
                .await?
                .into_iter()
                .map(|n| n.id)
                .collect();
            let key = twin.object_key();
            sources.extend(snapshot.online_among(&holders).into_iter().map(|n| (key, n)));
        }
        Ok(sources)
    }

    /// Store, then read back and verify, on `target`
    async fn store_verified(&self, chunk: &Chunk, blob: &VerifiedBlob, target: &Node) -> Result<()> {
        let transport = self.transport_for(target, Phase::Store)?;
        let key = chunk.object_key();
        let path = key.as_path();

        self.call(
            target,
            Phase::Store,
            transport.ensure_namespace(&self.config.namespace),
        )
        .await?;
        self.call(
            target,
            Phase::Store,
            transport.put(&self.config.namespace, &path, blob.data.clone()),
        )
        .await?;

        self.fetch_from(chunk, &key, target, Phase::Verify).await?;
        Ok(())
    }

    /// Replicate verified content to `target` and commit it.
    ///
    /// With [`SourcePolicy::Release`] the source replica is released once
    /// the target's link exists, provided another online replica besides
    /// source and target remains; otherwise the source is kept.
    ///
    /// Errors are only returned while nothing has been recorded. On success
    /// `target` (and a released source) carry their new counters.
    #[instrument(
        skip_all,
        fields(chunk_id = %chunk.id, chunk_number = chunk.chunk_number, node = %target.url)
    )]
    pub async fn replicate_to(
        &self,
        chunk: &Chunk,
        blob: &VerifiedBlob,
        target: &mut Node,
        policy: SourcePolicy<'_>,
    ) -> Result<Replication> {
        self.store_verified(chunk, blob, target).await?;

        let linked = self.repo.add_replica(chunk.id, target.id).await?;
        if !linked {
            debug!(phase = %Phase::Commit, "Target already linked, nothing to commit");
            return Ok(Replication {
                linked: false,
                release: ReleaseOutcome::Retained,
                drift: Vec::new(),
            });
        }

        let mut drift = Vec::new();
        let delta = target.record_replica_added(chunk.size_bytes);
        self.commit_counters(target, delta, &mut drift).await;
        debug!(phase = %Phase::Commit, load = target.load(), "Replica committed");

        let release = match policy {
            SourcePolicy::Retain => ReleaseOutcome::Retained,
            SourcePolicy::Release(source) => {
                match self.release(chunk, source, target.id, &mut drift).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(
                            node = %source.url,
                            phase = %Phase::Release,
                            error = %e,
                            "Could not release source, keeping it"
                        );
                        ReleaseOutcome::Kept
                    }
                }
            }
        };

        Ok(Replication {
            linked: true,
            release,
            drift,
        })
    }

    /// Persist `delta` for a link change that is already recorded, adopting
    /// the stored row. A failure leaves `node` with the local counters.
    async fn commit_counters(&self, node: &mut Node, delta: CounterDelta, drift: &mut Vec<CounterDrift>) {
        match self.repo.adjust_node_counters(node.id, delta).await {
            Ok(stored) => node.reset_counters(stored.load(), stored.storage_usage()),
            Err(e) => {
                warn!(node = %node.url, error = %e, "Counter update failed, counters drifted");
                drift.push(CounterDrift {
                    node: node.url.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Errors only before the source link is removed
    async fn release(
        &self,
        chunk: &Chunk,
        source: &mut Node,
        target_id: Uuid,
        drift: &mut Vec<CounterDrift>,
    ) -> Result<ReleaseOutcome> {
        let live = self.repo.replica_nodes(chunk.id).await?;
        let target_linked = live.iter().any(|n| n.id == target_id);
        let others = live
            .iter()
            .filter(|n| n.is_online() && n.id != source.id && n.id != target_id)
            .count();

        if !target_linked || others == 0 {
            warn!(
                node = %source.url,
                phase = %Phase::Release,
                "No other online replica, keeping source copy"
            );
            return Ok(ReleaseOutcome::Kept);
        }

        if !self.repo.remove_replica(chunk.id, source.id).await? {
            debug!(node = %source.url, "Source link already removed");
            return Ok(ReleaseOutcome::Released {
                blob_deleted: false,
            });
        }

        let delta = source.record_replica_removed(chunk.size_bytes);
        self.commit_counters(source, delta, drift).await;

        match self.blob_shared_on(chunk, source.id).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(node = %source.url, "Blob still referenced by a deduplicated chunk");
                return Ok(ReleaseOutcome::Released {
                    blob_deleted: false,
                });
            }
            Err(e) => {
                warn!(node = %source.url, error = %e, "Could not check blob sharing, source blob left behind");
                return Ok(ReleaseOutcome::Released {
                    blob_deleted: false,
                });
            }
        }

        let path = chunk.object_key().as_path();
        let deleted = match self.transport_for(source, Phase::Release) {
            Ok(transport) => self
                .call(
                    source,
                    Phase::Release,
                    transport.delete(&self.config.namespace, &path),
                )
                .await
                .map_err(|e| {
                    warn!(node = %source.url, error = %e, "Source blob left behind");
                })
                .is_ok(),
            Err(e) => {
                warn!(node = %source.url, error = %e, "Source blob left behind");
                false
            }
        };

        Ok(ReleaseOutcome::Released {
            blob_deleted: deleted,
        })
    }

    /// Whether another chunk linked to `node_id` stores its blob under this
    /// chunk's key
    async fn blob_shared_on(&self, chunk: &Chunk, node_id: Uuid) -> Result<bool> {
        let key = chunk.object_key();
        if !matches!(key, ObjectKey::ContentAddressed(_)) {
            return Ok(false);
        }

        let twins = self
            .repo
            .chunks_with_checksum(&chunk.checksum, chunk.size_bytes)
            .await?;
        for twin in twins
            .iter()
            .filter(|c| c.id != chunk.id && c.object_key() == key)
        {
            let holders = self.repo.replica_nodes(twin.id).await?;
            if holders.iter().any(|n| n.id == node_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
