//! Region-scoped request and response kinds exchanged with region stores.

use serde::{Deserialize, Serialize};

use crate::error::{ConflictReason, Error};
use crate::types::{Key, KvPair, Peer, Region, RegionEpoch, RegionId, StoreId, Timestamp, Value};

/// Addressing information attached to every region request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub region_id: RegionId,
    pub epoch: RegionEpoch,
    pub store_id: StoreId,
}

impl RequestContext {
    pub fn for_peer(region: &Region, peer: &Peer) -> Self {
        Self {
            region_id: region.id,
            epoch: region.epoch,
            store_id: peer.store_id,
        }
    }
}

/// Buffered operation on a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put(Value),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: Key,
    pub op: Op,
}

impl Mutation {
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            op: Op::Put(value.into()),
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            op: Op::Delete,
        }
    }
}

/// Prewrite lock as reported to a reader that trips over it.
///
/// The lock names its primary key instead of pointing at an in-memory
/// transaction, so resolving it is a lookup on the primary's region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: Key,
    pub primary: Key,
    pub start_ts: Timestamp,
    pub ttl_ms: u64,
}

impl LockInfo {
    /// A lock is stale once `ttl_ms` of physical time has passed since its
    /// owner started.
    pub fn is_expired(&self, current_ts: Timestamp) -> bool {
        current_ts.physical() >= self.start_ts.physical().saturating_add(self.ttl_ms)
    }
}

/// Per-key failure reported inside an otherwise successful region response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyError {
    Locked(LockInfo),
    WriteConflict {
        key: Key,
        start_ts: Timestamp,
        conflict_commit_ts: Timestamp,
    },
    AlreadyRolledBack {
        key: Key,
        start_ts: Timestamp,
    },
    AlreadyCommitted {
        key: Key,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },
    LockNotFound {
        key: Key,
        start_ts: Timestamp,
    },
    /// The request's version is below the store's GC safe point.
    GcExpired {
        start_ts: Timestamp,
        safe_point: Timestamp,
    },
    Other(String),
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Locked(lock) => Error::Conflict {
                key: lock.key,
                reason: ConflictReason::Locked {
                    holder_start_ts: lock.start_ts,
                },
            },
            KeyError::WriteConflict {
                key,
                conflict_commit_ts,
                ..
            } => Error::Conflict {
                key,
                reason: ConflictReason::WriteConflict { conflict_commit_ts },
            },
            KeyError::AlreadyRolledBack { key, .. } => Error::Conflict {
                key,
                reason: ConflictReason::RolledBack,
            },
            KeyError::LockNotFound { key, start_ts } => Error::Aborted {
                reason: format!("lock of transaction {start_ts} on key {key} is gone"),
            },
            KeyError::AlreadyCommitted {
                key,
                start_ts,
                commit_ts,
            } => Error::Fatal(format!(
                "key {key} of transaction {start_ts} already committed at {commit_ts}"
            )),
            KeyError::GcExpired {
                start_ts,
                safe_point,
            } => Error::GcExpired {
                start_ts,
                safe_point,
            },
            KeyError::Other(message) => Error::Fatal(message),
        }
    }
}

/// Outcome of a transaction as recorded on its primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Committed { commit_ts: Timestamp },
    RolledBack,
    /// The primary lock is still held and not yet expired.
    Locked { ttl_ms: u64 },
    /// Neither a lock nor a commit/rollback record exists on the primary.
    NotFound,
}

impl TxnStatus {
    /// Committed and rolled-back outcomes never change again.
    pub fn is_final(&self) -> bool {
        matches!(self, TxnStatus::Committed { .. } | TxnStatus::RolledBack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Get,
    BatchGet,
    Scan,
    Prewrite,
    Commit,
    Rollback,
    CheckTxnStatus,
    ResolveLock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get {
        key: Key,
        version: Timestamp,
    },
    BatchGet {
        keys: Vec<Key>,
        version: Timestamp,
    },
    /// Scans `[start_key, end_key)`; an empty `end_key` scans to the region end.
    Scan {
        start_key: Key,
        end_key: Key,
        limit: u32,
        version: Timestamp,
    },
    Prewrite {
        mutations: Vec<Mutation>,
        primary: Key,
        start_ts: Timestamp,
        lock_ttl_ms: u64,
    },
    Commit {
        keys: Vec<Key>,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },
    BatchRollback {
        keys: Vec<Key>,
        start_ts: Timestamp,
    },
    CheckTxnStatus {
        primary: Key,
        lock_ts: Timestamp,
        current_ts: Timestamp,
        rollback_if_not_exist: bool,
    },
    ResolveLock {
        keys: Vec<Key>,
        start_ts: Timestamp,
        commit_ts: Option<Timestamp>,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Get { .. } => RequestKind::Get,
            Request::BatchGet { .. } => RequestKind::BatchGet,
            Request::Scan { .. } => RequestKind::Scan,
            Request::Prewrite { .. } => RequestKind::Prewrite,
            Request::Commit { .. } => RequestKind::Commit,
            Request::BatchRollback { .. } => RequestKind::Rollback,
            Request::CheckTxnStatus { .. } => RequestKind::CheckTxnStatus,
            Request::ResolveLock { .. } => RequestKind::ResolveLock,
        }
    }

    /// Keys the receiving region must own. Scans only pin their start key;
    /// the end bound is clipped by the store.
    pub fn routed_keys(&self) -> Vec<&Key> {
        match self {
            Request::Get { key, .. } => vec![key],
            Request::BatchGet { keys, .. }
            | Request::Commit { keys, .. }
            | Request::BatchRollback { keys, .. }
            | Request::ResolveLock { keys, .. } => keys.iter().collect(),
            Request::Scan { start_key, .. } => vec![start_key],
            Request::Prewrite { mutations, .. } => mutations.iter().map(|m| &m.key).collect(),
            Request::CheckTxnStatus { primary, .. } => vec![primary],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Get {
        value: Option<Value>,
        error: Option<KeyError>,
    },
    BatchGet {
        pairs: Vec<KvPair>,
        errors: Vec<KeyError>,
    },
    Scan {
        pairs: Vec<KvPair>,
        error: Option<KeyError>,
    },
    Prewrite {
        errors: Vec<KeyError>,
    },
    Commit {
        error: Option<KeyError>,
    },
    BatchRollback {
        error: Option<KeyError>,
    },
    CheckTxnStatus {
        status: TxnStatus,
    },
    ResolveLock {
        error: Option<KeyError>,
    },
}

impl Response {
    pub fn kind(&self) -> RequestKind {
        match self {
            Response::Get { .. } => RequestKind::Get,
            Response::BatchGet { .. } => RequestKind::BatchGet,
            Response::Scan { .. } => RequestKind::Scan,
            Response::Prewrite { .. } => RequestKind::Prewrite,
            Response::Commit { .. } => RequestKind::Commit,
            Response::BatchRollback { .. } => RequestKind::Rollback,
            Response::CheckTxnStatus { .. } => RequestKind::CheckTxnStatus,
            Response::ResolveLock { .. } => RequestKind::ResolveLock,
        }
    }

    /// Error for a store that answered with the wrong response kind.
    pub fn mismatch(self, expected: RequestKind) -> Error {
        Error::Fatal(format!(
            "expected {expected:?} response, store returned {:?}",
            self.kind()
        ))
    }
}

/// Region-level rejection: the request reached the wrong place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionError {
    NotLeader {
        region_id: RegionId,
        leader: Option<Peer>,
    },
    EpochNotMatch {
        region_id: RegionId,
    },
    RegionNotFound {
        region_id: RegionId,
    },
    KeyNotInRegion {
        key: Key,
        region_id: RegionId,
    },
    ServerBusy,
    Other(String),
}

/// What a region store answers: either a response or a routing rejection.
pub type RegionResult = Result<Response, RegionError>;
