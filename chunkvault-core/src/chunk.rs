//! Object keys for chunk blobs
//!
//! A chunk's blob lives on every replica node under the same deterministic
//! key, so any replica can serve as a fetch source for any other.

use crate::checksum::Checksum;
use crate::error::{ChunkVaultError, Result};
use crate::MAX_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Key of a chunk blob inside the node namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKey {
    /// `<file_id>/<chunk_number>`, the layout written by the upload path
    Positional { file_id: Uuid, chunk_number: u32 },
    /// `sha256/<hex>`, shared by every file whose slice hashes to the same digest
    ContentAddressed(Checksum),
}

impl ObjectKey {
    /// Render the key as stored on the node
    pub fn as_path(&self) -> String {
        match self {
            Self::Positional {
                file_id,
                chunk_number,
            } => format!("{}/{}", file_id, chunk_number),
            Self::ContentAddressed(checksum) => format!("sha256/{}", checksum.to_hex()),
        }
    }

    /// Parse a key previously produced by [`ObjectKey::as_path`]
    pub fn parse(path: &str) -> Result<Self> {
        let (head, tail) = path
            .split_once('/')
            .ok_or_else(|| ChunkVaultError::InvalidObjectKey(path.to_string()))?;

        if head == "sha256" {
            let checksum = Checksum::from_hex(tail)
                .map_err(|_| ChunkVaultError::InvalidObjectKey(path.to_string()))?;
            return Ok(Self::ContentAddressed(checksum));
        }

        let file_id =
            Uuid::parse_str(head).map_err(|_| ChunkVaultError::InvalidObjectKey(path.to_string()))?;
        let chunk_number = tail
            .parse::<u32>()
            .map_err(|_| ChunkVaultError::InvalidObjectKey(path.to_string()))?;

        Ok(Self::Positional {
            file_id,
            chunk_number,
        })
    }
}

/// Reject a chunk larger than the upload path can produce
pub fn check_chunk_size(size: usize) -> Result<()> {
    if size > MAX_CHUNK_SIZE {
        return Err(ChunkVaultError::ChunkTooLarge {
            size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path())
    }
}
