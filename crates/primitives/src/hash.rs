use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

const BYTES_LEN: usize = 32;

/// Content hash of a log entry.
///
/// Derived with SHA-256 over the entry payload; displayed as base58.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct EntryHash([u8; BYTES_LEN]);

impl EntryHash {
    /// Hash arbitrary bytes into an entry hash.
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        Self(sha2::Sha256::digest(data).into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BYTES_LEN] {
        &self.0
    }
}

impl From<[u8; BYTES_LEN]> for EntryHash {
    fn from(bytes: [u8; BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for EntryHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryHash({self})")
    }
}

/// Failure to parse a base58 entry hash.
#[derive(Debug, Error)]
#[error("invalid entry hash: {0}")]
pub struct InvalidEntryHash(String);

impl FromStr for EntryHash {
    type Err = InvalidEntryHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES_LEN];
        match bs58::decode(s).onto(&mut bytes) {
            Ok(len) if len == BYTES_LEN => Ok(Self(bytes)),
            Ok(len) => Err(InvalidEntryHash(format!("expected 32 bytes, got {len}"))),
            Err(err) => Err(InvalidEntryHash(err.to_string())),
        }
    }
}
