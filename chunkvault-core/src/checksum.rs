//! Chunk checksums
//!
//! Every chunk records the SHA-256 digest of its plaintext content at upload
//! time. The digest never changes afterwards, so it is the sole integrity gate
//! a blob must pass before it is trusted for re-upload to another node.

use crate::error::{ChunkVaultError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest of a chunk's content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Compute the checksum of a byte buffer
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Self(arr)
    }

    /// Lowercase hex form, as stored in the metadata repository
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex digest (case-insensitive)
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ChunkVaultError::InvalidChecksum(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(ChunkVaultError::InvalidChecksum(format!(
                "Invalid length: expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that `data` hashes to this checksum
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    /// Like [`Checksum::matches`], but returns both digests on failure
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Self::compute(data);
        if actual == *self {
            Ok(())
        } else {
            Err(ChunkVaultError::ChecksumMismatch {
                expected: self.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }
}

/// Compare a buffer against a recorded hex digest.
///
/// A malformed recorded digest never matches.
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    match Checksum::from_hex(expected) {
        Ok(checksum) => checksum.matches(data),
        Err(_) => false,
    }
}

impl FromStr for Checksum {
    type Err = ChunkVaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_digest() {
        let checksum = Checksum::compute(b"hello world");
        assert_eq!(
            checksum.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_checksum_accepts_uppercase() {
        let hex = Checksum::compute(b"chunk").to_hex().to_uppercase();
        assert!(verify_checksum(b"chunk", &hex));
    }

    #[test]
    fn test_verify_checksum_rejects_other_content() {
        let hex = Checksum::compute(b"chunk").to_hex();
        assert!(!verify_checksum(b"chunk!", &hex));
    }

    #[test]
    fn test_malformed_digest_never_matches() {
        assert!(!verify_checksum(b"anything", "not-hex"));
        assert!(!verify_checksum(b"anything", "abcd"));
    }

    #[test]
    fn test_verify_reports_both_digests() {
        let expected = Checksum::compute(b"a");
        let err = expected.verify(b"b").unwrap_err();
        match err {
            ChunkVaultError::ChecksumMismatch { expected: e, actual } => {
                assert_eq!(e, expected.to_hex());
                assert_eq!(actual, Checksum::compute(b"b").to_hex());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    proptest! {
        #[test]
        fn prop_compute_then_verify(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let checksum = Checksum::compute(&data);
            prop_assert!(verify_checksum(&data, &checksum.to_hex()));
            prop_assert_eq!(Checksum::from_hex(&checksum.to_hex()).unwrap(), checksum);
        }
    }
}
