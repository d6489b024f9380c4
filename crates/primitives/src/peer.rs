use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BYTES_LEN: usize = 32;

/// Public-key identifier of a peer.
///
/// The replication layer never verifies signatures itself; identity is an
/// external collaborator. What it does rely on is that peer ids order
/// consistently on every node, which the derived `Ord` over the raw bytes
/// provides. The boundary tie-break rule depends on this.
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
pub struct PeerId([u8; BYTES_LEN]);

impl PeerId {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BYTES_LEN] {
        &self.0
    }
}

impl From<[u8; BYTES_LEN]> for PeerId {
    fn from(bytes: [u8; BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Failure to parse a base58 peer id.
#[derive(Debug, Error)]
#[error("invalid peer id: {0}")]
pub struct InvalidPeerId(String);

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES_LEN];
        match bs58::decode(s).onto(&mut bytes) {
            Ok(len) if len == BYTES_LEN => Ok(Self(bytes)),
            Ok(len) => Err(InvalidPeerId(format!("expected 32 bytes, got {len}"))),
            Err(err) => Err(InvalidPeerId(err.to_string())),
        }
    }
}
