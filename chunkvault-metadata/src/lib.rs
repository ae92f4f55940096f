//! ChunkVault Metadata
//!
//! Durable records of files, chunks, storage nodes and the replica links
//! between chunks and nodes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  MetadataRepository                       │
//! │                                                          │
//! │  ┌──────────────────┐        ┌────────────────────────┐  │
//! │  │     Database     │        │   InMemoryRepository   │  │
//! │  │   (PostgreSQL)   │        │   (tests, local runs)  │  │
//! │  └──────────────────┘        └────────────────────────┘  │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │                   HealthProbe                      │  │
//! │  │        (refreshes Node status via transport)       │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chunkvault_metadata::{Database, DbConfig, MetadataRepository};
//!
//! let db = Database::new(DbConfig::with_url(url)).await?;
//! db.migrate().await?;
//!
//! for chunk in db.under_replicated_chunks(2).await? {
//!     let holders = db.replica_nodes(chunk.id).await?;
//! }
//! ```

pub mod health;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repository;

pub use health::{evaluate_probe, HealthCheckResult, HealthConfig, HealthProbe, HealthSummary};
pub use memory::InMemoryRepository;
pub use models::*;
pub use postgres::{Database, DbConfig};
pub use repository::{MetadataError, MetadataRepository, Result};
