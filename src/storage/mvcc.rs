use serde::{Deserialize, Serialize};

use crate::rpc::{LockInfo, Op};
use crate::types::{Key, Timestamp, Value};

/// What a committed (or rolled back) transaction left behind on a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteKind {
    Put(Value),
    Delete,
    /// Tombstone recording that `start_ts` was rolled back here, so a late
    /// prewrite from that transaction is refused.
    Rollback,
}

/// Write record: the commit of `start_ts` made visible at `commit_ts`.
/// Rollback records use `commit_ts == start_ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRecord {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub kind: WriteKind,
}

impl WriteRecord {
    pub fn committed(start_ts: Timestamp, commit_ts: Timestamp, op: Op) -> Self {
        let kind = match op {
            Op::Put(value) => WriteKind::Put(value),
            Op::Delete => WriteKind::Delete,
        };
        Self {
            start_ts,
            commit_ts,
            kind,
        }
    }

    pub fn rollback(start_ts: Timestamp) -> Self {
        Self {
            start_ts,
            commit_ts: start_ts,
            kind: WriteKind::Rollback,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self.kind, WriteKind::Rollback)
    }
}

/// Prewrite lock held on a key until its transaction commits or rolls back.
/// The pending value travels with the lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    pub primary: Key,
    pub start_ts: Timestamp,
    pub ttl_ms: u64,
    pub op: Op,
}

impl Lock {
    pub fn info(&self, key: &Key) -> LockInfo {
        LockInfo {
            key: key.clone(),
            primary: self.primary.clone(),
            start_ts: self.start_ts,
            ttl_ms: self.ttl_ms,
        }
    }
}

/// Write records of a single key ordered by commit timestamp.
#[derive(Debug, Default, Clone)]
pub struct VersionChain {
    pub versions: Vec<WriteRecord>,
}

impl VersionChain {
    pub fn append(&mut self, record: WriteRecord) {
        let insert_idx = self
            .versions
            .partition_point(|existing| existing.commit_ts <= record.commit_ts);
        self.versions.insert(insert_idx, record);
    }

    /// Newest data record committed at or before `snapshot_ts`.
    pub fn latest_visible(&self, snapshot_ts: Timestamp) -> Option<&WriteRecord> {
        let idx = self
            .versions
            .partition_point(|version| version.commit_ts <= snapshot_ts);
        self.versions[..idx]
            .iter()
            .rev()
            .find(|version| !version.is_rollback())
    }

    /// Value as of `snapshot_ts`; deletes read as absent.
    pub fn value_at(&self, snapshot_ts: Timestamp) -> Option<&Value> {
        match self.latest_visible(snapshot_ts).map(|record| &record.kind) {
            Some(WriteKind::Put(value)) => Some(value),
            _ => None,
        }
    }

    /// Newest data record committed at or after `start_ts`, i.e. a write the
    /// transaction starting at `start_ts` could not have seen.
    pub fn newer_than(&self, start_ts: Timestamp) -> Option<&WriteRecord> {
        self.versions
            .iter()
            .rev()
            .take_while(|version| version.commit_ts >= start_ts)
            .find(|version| !version.is_rollback())
    }

    pub fn find_by_start_ts(&self, start_ts: Timestamp) -> Option<&WriteRecord> {
        self.versions
            .iter()
            .rev()
            .find(|version| version.start_ts == start_ts)
    }

    /// Drops every record a reader at or above `safe_point` can no longer
    /// observe, keeping the newest visible put. Returns how many records went.
    pub fn gc(&mut self, safe_point: Timestamp) -> usize {
        let before = self.versions.len();
        let split = self
            .versions
            .partition_point(|version| version.commit_ts <= safe_point);
        let keep_from = self.versions[..split]
            .iter()
            .rposition(|version| !version.is_rollback())
            .filter(|&idx| matches!(self.versions[idx].kind, WriteKind::Put(_)));

        let mut retained: Vec<WriteRecord> = Vec::with_capacity(before - split + 1);
        if let Some(idx) = keep_from {
            retained.push(self.versions[idx].clone());
        }
        retained.extend(self.versions.drain(split..));
        self.versions = retained;
        before - self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(version: u64) -> Timestamp {
        Timestamp::from_version(version)
    }

    fn put(start: u64, commit: u64, value: &[u8]) -> WriteRecord {
        WriteRecord::committed(ts(start), ts(commit), Op::Put(value.to_vec()))
    }

    #[test]
    fn append_orders_versions() {
        let mut chain = VersionChain::default();
        chain.append(put(25, 30, b"third"));
        chain.append(put(5, 10, b"first"));
        chain.append(put(15, 20, b"second"));

        let commit_ts: Vec<Timestamp> = chain.versions.iter().map(|v| v.commit_ts).collect();
        assert_eq!(commit_ts, vec![ts(10), ts(20), ts(30)]);
    }

    #[test]
    fn visibility_skips_rollbacks_and_honours_deletes() {
        let mut chain = VersionChain::default();
        chain.append(put(5, 10, b"v1"));
        chain.append(WriteRecord::rollback(ts(12)));
        chain.append(WriteRecord::committed(ts(14), ts(15), Op::Delete));

        assert!(chain.value_at(ts(9)).is_none());
        assert_eq!(chain.value_at(ts(13)), Some(&b"v1".to_vec()));
        assert!(chain.value_at(ts(20)).is_none());
    }

    #[test]
    fn newer_than_ignores_foreign_rollbacks() {
        let mut chain = VersionChain::default();
        chain.append(put(5, 10, b"v1"));
        chain.append(WriteRecord::rollback(ts(40)));

        assert!(chain.newer_than(ts(11)).is_none());
        assert_eq!(chain.newer_than(ts(10)).map(|r| r.commit_ts), Some(ts(10)));
    }

    #[test]
    fn gc_keeps_newest_visible_put() {
        let mut chain = VersionChain::default();
        chain.append(put(1, 2, b"old"));
        chain.append(put(3, 4, b"kept"));
        chain.append(WriteRecord::rollback(ts(5)));
        chain.append(put(9, 10, b"new"));

        assert_eq!(chain.gc(ts(6)), 2);
        assert_eq!(chain.value_at(ts(6)), Some(&b"kept".to_vec()));
        assert_eq!(chain.value_at(ts(10)), Some(&b"new".to_vec()));
    }

    #[test]
    fn gc_drops_everything_behind_a_delete() {
        let mut chain = VersionChain::default();
        chain.append(put(1, 2, b"v"));
        chain.append(WriteRecord::committed(ts(3), ts(4), Op::Delete));

        assert_eq!(chain.gc(ts(5)), 2);
        assert!(chain.is_empty());
    }
}
