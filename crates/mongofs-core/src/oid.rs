//! Native document identifiers.
//!
//! An [`ObjectId`] is 12 bytes rendered as 24 hex characters:
//!
//! | bytes | content |
//! |-------|---------|
//! | 0..4  | seconds since the Unix epoch, big-endian |
//! | 4..9  | random value, fixed for the lifetime of the process |
//! | 9..12 | counter, big-endian, starting at a random value |

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of an identifier in bytes.
pub const OID_LEN: usize = 12;

/// Length of an identifier in its hex form.
pub const OID_HEX_LEN: usize = OID_LEN * 2;

const COUNTER_MASK: u32 = 0x00ff_ffff;

/// Error returned when a string is not a valid identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid object id: {0:?}")]
pub struct ParseOidError(pub String);

/// A 12-byte document identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OID_LEN]);

fn process_unique() -> &'static [u8; 5] {
    static UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
    UNIQUE.get_or_init(|| rand::rng().random())
}

fn next_counter() -> u32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    COUNTER
        .get_or_init(|| AtomicU32::new(rand::rng().random::<u32>() & COUNTER_MASK))
        .fetch_add(1, Ordering::Relaxed)
        & COUNTER_MASK
}

impl ObjectId {
    /// Generates a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        // The timestamp field is 32 bits wide and wraps in 2106.
        #[allow(clippy::cast_possible_truncation)]
        let secs = secs as u32;

        let mut bytes = [0u8; OID_LEN];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(process_unique());
        bytes[9..].copy_from_slice(&next_counter().to_be_bytes()[1..]);
        Self(bytes)
    }

    /// Wraps raw bytes.
    pub const fn from_bytes(bytes: [u8; OID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn bytes(&self) -> [u8; OID_LEN] {
        self.0
    }

    /// Parses a 24-character hex string (either case).
    pub fn parse_str(s: &str) -> Result<Self, ParseOidError> {
        if s.len() != OID_HEX_LEN {
            return Err(ParseOidError(s.to_string()));
        }
        let mut bytes = [0u8; OID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseOidError(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Creation time embedded in the identifier.
    pub fn timestamp(&self) -> SystemTime {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        UNIX_EPOCH + Duration::from_secs(u64::from(secs))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_str(&s).map_err(serde::de::Error::custom)
    }
}
