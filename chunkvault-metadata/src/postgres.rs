//! PostgreSQL metadata repository
//!
//! Runtime-checked queries via SQLx. Counter updates are single `UPDATE`
//! statements with relative arithmetic, so concurrent writers never lose an
//! increment.

use crate::models::*;
use crate::repository::{MetadataError, MetadataRepository, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/chunkvault".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl DbConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// PostgreSQL database client
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(config: DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataRepository for Database {
    // =========================================================================
    // NODE OPERATIONS
    // =========================================================================

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let result = sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(result)
    }

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
        let result = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn adjust_node_counters(&self, node_id: Uuid, delta: CounterDelta) -> Result<Node> {
        let result = sqlx::query_as::<_, Node>(
            r#"
            UPDATE nodes
            SET load = GREATEST(load + $2, 0),
                storage_usage = GREATEST(storage_usage + $3, 0)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(node_id)
        .bind(delta.load)
        .bind(delta.storage_bytes)
        .fetch_optional(&self.pool)
        .await?;

        result.ok_or_else(|| MetadataError::NotFound(format!("node {}", node_id)))
    }

    async fn set_node_counters(&self, node_id: Uuid, load: i64, storage_usage: i64) -> Result<()> {
        let result = sqlx::query("UPDATE nodes SET load = $2, storage_usage = $3 WHERE id = $1")
            .bind(node_id)
            .bind(load.max(0))
            .bind(storage_usage.max(0))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("node {}", node_id)));
        }
        debug!(%node_id, load, storage_usage, "Node counters reset");
        Ok(())
    }

    async fn record_node_health(&self, node_id: Uuid, update: &NodeHealthUpdate) -> Result<Node> {
        let result = sqlx::query_as::<_, Node>(
            r#"
            UPDATE nodes
            SET status = $2,
                last_check = $3,
                last_latency_ms = COALESCE($4, last_latency_ms),
                consecutive_failures = $5,
                failed_at = $6,
                recovered_at = $7
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(node_id)
        .bind(update.status)
        .bind(update.checked_at)
        .bind(update.latency_ms)
        .bind(update.consecutive_failures)
        .bind(update.failed_at)
        .bind(update.recovered_at)
        .fetch_optional(&self.pool)
        .await?;

        result.ok_or_else(|| MetadataError::NotFound(format!("node {}", node_id)))
    }

    // =========================================================================
    // FILE & CHUNK OPERATIONS
    // =========================================================================

    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>> {
        let result = sqlx::query_as::<_, File>("SELECT * FROM files WHERE id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(result)
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        let result = sqlx::query_as::<_, Chunk>("SELECT * FROM chunks WHERE id = $1")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(result)
    }

    async fn under_replicated_chunks(&self, min_replicas: usize) -> Result<Vec<Chunk>> {
        let result = sqlx::query_as::<_, Chunk>(
            r#"
            SELECT c.*
            FROM chunks c
            JOIN files f ON f.id = c.file_id
            WHERE (
                SELECT COUNT(*)
                FROM replicas r
                JOIN nodes n ON n.id = r.node_id
                WHERE r.chunk_id = c.id AND n.status = 'online'
            ) < $1
            ORDER BY f.created_at, c.file_id, c.chunk_number
            "#,
        )
        .bind(min_replicas as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    async fn chunks_with_checksum(&self, checksum: &str, size_bytes: i64) -> Result<Vec<Chunk>> {
        let result = sqlx::query_as::<_, Chunk>(
            r#"
            SELECT c.*
            FROM chunks c
            JOIN files f ON f.id = c.file_id
            WHERE c.checksum = LOWER($1) AND c.size_bytes = $2
            ORDER BY f.created_at, c.file_id, c.chunk_number
            "#,
        )
        .bind(checksum)
        .bind(size_bytes)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    // =========================================================================
    // REPLICA OPERATIONS
    // =========================================================================

    async fn replica_nodes(&self, chunk_id: Uuid) -> Result<Vec<Node>> {
        let result = sqlx::query_as::<_, Node>(
            r#"
            SELECT n.*
            FROM nodes n
            JOIN replicas r ON r.node_id = n.id
            WHERE r.chunk_id = $1
            ORDER BY n.id
            "#,
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    async fn node_chunks(&self, node_id: Uuid) -> Result<Vec<Chunk>> {
        let result = sqlx::query_as::<_, Chunk>(
            r#"
            SELECT c.*
            FROM chunks c
            JOIN replicas r ON r.chunk_id = c.id
            JOIN files f ON f.id = c.file_id
            WHERE r.node_id = $1
            ORDER BY f.created_at, c.file_id, c.chunk_number
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn add_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO replicas (chunk_id, node_id)
            VALUES ($1, $2)
            ON CONFLICT (chunk_id, node_id) DO NOTHING
            "#,
        )
        .bind(chunk_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn remove_replica(&self, chunk_id: Uuid, node_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM replicas WHERE chunk_id = $1 AND node_id = $2")
            .bind(chunk_id)
            .bind(node_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
