//! Content checksums for locally stored payloads.
//!
//! The digest is diagnostic only: it flags silent corruption of a stored
//! payload, it does not authenticate anything.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::CoreError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// BLAKE3 over the canonical JSON encoding of `payload`.
    ///
    /// `serde_json::Map` is key-ordered, so equal values always encode to the
    /// same bytes regardless of insertion order.
    pub fn of(payload: &Value) -> Result<Self, CoreError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(Self(*blake3::hash(&bytes).as_bytes()))
    }

    /// Recompute the digest of `payload` and compare it with `self`.
    pub fn verify(&self, payload: &Value) -> Result<(), ChecksumMismatch> {
        let actual = match Self::of(payload) {
            Ok(c) => c,
            Err(_) => Checksum([0u8; 32]),
        };
        if actual == *self {
            Ok(())
        } else {
            Err(ChecksumMismatch {
                expected: *self,
                actual,
            })
        }
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({:02x}{:02x}...)", self.0[0], self.0[1])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A stored payload no longer matches the digest recorded with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("checksum mismatch: stored {expected}, computed {actual}")]
pub struct ChecksumMismatch {
    pub expected: Checksum,
    pub actual: Checksum,
}
