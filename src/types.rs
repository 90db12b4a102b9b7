use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// Raw value payload stored per version.
pub type Value = Vec<u8>;
/// Identifier of a region (key-range partition).
pub type RegionId = u64;
/// Identifier of a storage node hosting region replicas.
pub type StoreId = u64;

/// Opaque key ordered byte-wise.
///
/// The empty key doubles as "unbounded" when it appears as a range end.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub const EMPTY: Key = Key(Vec::new());

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Smallest key strictly greater than `self`.
    pub fn next_key(&self) -> Key {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(&self.0);
        bytes.push(0);
        Key(bytes)
    }
}

impl Deref for Key {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Key {
    fn from(bytes: &[u8; N]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            for escaped in std::ascii::escape_default(*byte) {
                write!(f, "{}", escaped as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(\"{self}\")")
    }
}

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid logical timestamp: physical milliseconds in the high bits, a
/// logical counter in the low [`LOGICAL_BITS`] bits.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn from_version(version: u64) -> Self {
        Self(version)
    }

    pub fn compose(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub const fn version(self) -> u64 {
        self.0
    }

    pub const fn physical(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub const fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Returns the timestamp `ms` milliseconds of physical time later.
    pub fn add_physical_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms.saturating_mul(1 << LOGICAL_BITS)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}.{})", self.physical(), self.logical())
    }
}

/// Key/value pair yielded by reads and scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Key,
    pub value: Value,
}

impl KvPair {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Version counters bumped by membership changes and by splits/merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// A replica of a region placed on a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: StoreId,
    pub addr: String,
}

/// Immutable description of a region as known at one moment.
///
/// An empty `end_key` means the region extends to the end of the key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Key,
    pub end_key: Key,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<Peer>,
}

impl Region {
    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.start_key && (self.end_key.is_empty() || key < &self.end_key)
    }

    /// True when the two half-open ranges share at least one key.
    pub fn overlaps(&self, other: &Region) -> bool {
        let starts_before_other_ends = other.end_key.is_empty() || self.start_key < other.end_key;
        let ends_after_other_starts = self.end_key.is_empty() || other.start_key < self.end_key;
        starts_before_other_ends && ends_after_other_starts
    }

    pub fn leader(&self) -> Option<&Peer> {
        self.leader.as_ref()
    }

    /// Copy of this descriptor with a different leader.
    pub fn with_leader(&self, leader: Peer) -> Region {
        Region {
            leader: Some(leader),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: &str, end: &str) -> Region {
        Region {
            id: 1,
            start_key: start.into(),
            end_key: end.into(),
            epoch: RegionEpoch::default(),
            peers: Vec::new(),
            leader: None,
        }
    }

    #[test]
    fn timestamp_splits_physical_and_logical() {
        let ts = Timestamp::compose(1_700_000_000_000, 42);
        assert_eq!(ts.physical(), 1_700_000_000_000);
        assert_eq!(ts.logical(), 42);
        assert!(Timestamp::compose(1, 0) > Timestamp::compose(0, LOGICAL_MASK));
        assert_eq!(ts.add_physical_ms(5).physical(), 1_700_000_000_005);
    }

    #[test]
    fn next_key_is_immediate_successor() {
        let key = Key::from("a");
        let next = key.next_key();
        assert!(next > key);
        assert!(next < Key::from("a\x01"));
        assert!(next < Key::from("b"));
    }

    #[test]
    fn region_bounds_are_half_open() {
        let bounded = region("b", "d");
        assert!(!bounded.contains(&"a".into()));
        assert!(bounded.contains(&"b".into()));
        assert!(bounded.contains(&Key::from(b"c\xff")));
        assert!(!bounded.contains(&"d".into()));

        let tail = region("d", "");
        assert!(tail.contains(&"zzzz".into()));
        assert!(!tail.overlaps(&bounded));
        assert!(region("", "").overlaps(&bounded));
        assert!(region("c", "e").overlaps(&bounded));
    }

    #[test]
    fn key_display_escapes_binary() {
        assert_eq!(Key::from(&[b'k', 0u8, 0xff]).to_string(), "k\\x00\\xff");
    }
}
