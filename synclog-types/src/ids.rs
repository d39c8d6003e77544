//! Identifier types used throughout synclog.
//!
//! Entry ids pack the creation millisecond into the high 48 bits and fill
//! the low 80 bits with randomness. Big-endian byte order, numeric order and
//! creation order therefore all agree, and the timestamp can be read back
//! out of any id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Number of low bits filled with randomness.
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1u128 << RANDOM_BITS) - 1;
/// Timestamps are truncated to 48 bits (good until the year 10889).
const TIMESTAMP_MASK: u64 = (1u64 << 48) - 1;

/// Process-wide generator behind [`EntryId::new`].
static GENERATOR: IdGenerator = IdGenerator::new();

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Unique, sortable identifier for a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new entry id at the current time from the process-wide
    /// generator.
    #[must_use]
    pub fn new() -> Self {
        GENERATOR.next(now_millis())
    }

    /// Creates an entry id for the given millisecond timestamp from the
    /// process-wide generator.
    #[must_use]
    pub fn generate(now_millis: u64) -> Self {
        GENERATOR.next(now_millis)
    }

    /// Creates an entry id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates an entry id from its 16 big-endian bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the big-endian bytes. Comparing these compares ids.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the millisecond timestamp embedded at creation.
    #[must_use]
    pub fn millis(&self) -> u64 {
        (self.0.as_u128() >> RANDOM_BITS) as u64
    }

    /// Parses an entry id from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Monotonic entry id generator.
///
/// Ids from one generator strictly increase as long as the supplied
/// timestamps do not decrease. When the clock stalls or steps backwards the
/// previous id's suffix is incremented instead of drawing a fresh one. The
/// timestamp half is never touched by that increment; once a millisecond's
/// suffixes are used up the generator moves on to the next millisecond.
#[derive(Debug)]
pub struct IdGenerator {
    last: Mutex<u128>,
}

impl IdGenerator {
    /// Creates a generator that has issued no ids yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    /// Creates a generator whose ids all sort after `last`, e.g. the newest
    /// id found in a journal on startup.
    #[must_use]
    pub fn resume(last: EntryId) -> Self {
        Self {
            last: Mutex::new(last.0.as_u128()),
        }
    }

    /// Issues the next id for `now_millis`.
    pub fn next(&self, now_millis: u64) -> EntryId {
        let prefix = u128::from(now_millis & TIMESTAMP_MASK) << RANDOM_BITS;
        let candidate = prefix | (rand::random::<u128>() & RANDOM_MASK);

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let value = if candidate > *last {
            candidate
        } else {
            successor(*last)
        };
        *last = value;
        EntryId(Uuid::from_u128(value))
    }
}

/// Smallest useful id after `last` that keeps its timestamp meaningful.
fn successor(last: u128) -> u128 {
    if last & RANDOM_MASK < RANDOM_MASK {
        return last + 1;
    }
    let millis = (last >> RANDOM_BITS) as u64;
    if millis >= TIMESTAMP_MASK {
        // Out of timestamp range; nothing sorts after this.
        return last;
    }
    // Half the suffix space is left for later increments in this millisecond.
    let suffix = rand::random::<u128>() & (RANDOM_MASK >> 1);
    (u128::from(millis + 1) << RANDOM_BITS) | suffix
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a synchronization peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(Uuid);

impl RemoteId {
    /// Creates a new random remote id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a remote id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a remote id from its 16 bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parses a remote id from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RemoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
