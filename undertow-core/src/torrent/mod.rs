//! Torrent identity types shared by every layer of the streaming stack.

pub mod magnet;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use magnet::{MagnetLink, MagnetParser};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used as the primary key for session and persistence lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the lowercase hex form used in file names and records.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Error returned when a string is not a 40-character hex info hash.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid info hash: {value}")]
pub struct InvalidInfoHash {
    pub value: String,
}

impl FromStr for InfoHash {
    type Err = InvalidInfoHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidInfoHash {
            value: s.to_string(),
        };
        let bytes = hex::decode(s).map_err(|_| invalid())?;
        let hash: [u8; 20] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
