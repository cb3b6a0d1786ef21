//! Identifiers, time arithmetic and the bincode helpers shared across the crate.

use bincode::Options;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::MetaError;

/// Represents a unique identifier for a node in the cluster
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a position in the command log
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    /// A zero log index, meaning nothing has been appended or applied
    pub const ZERO: LogIndex = LogIndex(0);

    /// Creates a new LogIndex from a raw u64 value
    pub fn new(i: u64) -> Self {
        LogIndex(i)
    }

    /// Returns the raw u64 value of this log index
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the index immediately after this one
    pub fn next(self) -> Self {
        LogIndex(self.0 + 1)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shortest finite retention duration accepted for a retention policy.
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(3_600);

const NANOS_PER_SEC: i128 = 1_000_000_000;

fn to_nanos(ts: DateTime<Utc>) -> i128 {
    ts.timestamp() as i128 * NANOS_PER_SEC + ts.timestamp_subsec_nanos() as i128
}

fn from_nanos(nanos: i128) -> Result<DateTime<Utc>, MetaError> {
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let sub = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    let secs = i64::try_from(secs)
        .map_err(|_| MetaError::InvalidArgument("timestamp out of range".to_string()))?;
    Utc.timestamp_opt(secs, sub)
        .single()
        .ok_or_else(|| MetaError::InvalidArgument("timestamp out of range".to_string()))
}

/// Rounds `ts` down to a multiple of `width` measured from the Unix epoch.
///
/// Works on 128-bit nanoseconds so timestamps far before the epoch bucket correctly.
pub fn floor_timestamp(ts: DateTime<Utc>, width: Duration) -> Result<DateTime<Utc>, MetaError> {
    let width = width.as_nanos() as i128;
    if width == 0 {
        return Err(MetaError::InvalidArgument(
            "shard group duration must be non-zero".to_string(),
        ));
    }
    let nanos = to_nanos(ts);
    from_nanos(nanos - nanos.rem_euclid(width))
}

/// Returns `ts + d`, failing if the result is not representable.
pub fn add_duration(ts: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>, MetaError> {
    from_nanos(to_nanos(ts) + d.as_nanos() as i128)
}

/// Returns `ts - d`, failing if the result is not representable.
pub fn sub_duration(ts: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>, MetaError> {
    from_nanos(to_nanos(ts) - d.as_nanos() as i128)
}

/// Encodes a value with the crate's on-disk and on-wire bincode options.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MetaError> {
    bincode::DefaultOptions::new()
        .serialize(value)
        .map_err(|e| MetaError::Serialization(e.to_string()))
}

/// Decodes a value written by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
    bincode::DefaultOptions::new()
        .deserialize(bytes)
        .map_err(|e| MetaError::Serialization(e.to_string()))
}
