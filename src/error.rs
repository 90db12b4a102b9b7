use thiserror::Error;

use crate::types::{Key, Timestamp};

/// Why a transaction lost a write-write or lock race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// A live lock from another transaction sits on the key.
    Locked { holder_start_ts: Timestamp },
    /// A version newer than our start timestamp was already committed.
    WriteConflict { conflict_commit_ts: Timestamp },
    /// Another party rolled this transaction back while it was prewriting.
    RolledBack,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::Locked { holder_start_ts } => {
                write!(f, "locked by transaction {holder_start_ts}")
            }
            ConflictReason::WriteConflict { conflict_commit_ts } => {
                write!(f, "newer version committed at {conflict_commit_ts}")
            }
            ConflictReason::RolledBack => write!(f, "transaction was rolled back"),
        }
    }
}

/// Classified reason behind a retryable RPC failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    LeaderChanged,
    RegionSplit,
    Timeout,
    Unavailable,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RetryReason::LeaderChanged => "leader changed",
            RetryReason::RegionSplit => "region split",
            RetryReason::Timeout => "timeout",
            RetryReason::Unavailable => "unavailable",
        };
        f.write_str(label)
    }
}

/// Errors surfaced across the public client boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("conflict on key {key}: {reason}")]
    Conflict { key: Key, reason: ConflictReason },
    #[error("snapshot at {start_ts} is older than gc safe point {safe_point}")]
    GcExpired {
        start_ts: Timestamp,
        safe_point: Timestamp,
    },
    #[error("transaction aborted: {reason}")]
    Aborted { reason: String },
    #[error("commit outcome undetermined: {reason}")]
    Undetermined { reason: String },
    #[error("retry budget exhausted after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: u32, reason: RetryReason },
    #[error("timestamp service unavailable: {0}")]
    Unavailable(String),
    #[error("fatal backend error: {0}")]
    Fatal(String),
    #[error("key must not be empty")]
    EmptyKey,
    #[error("entry of {size} bytes exceeds the {limit} byte limit")]
    EntryTooLarge { size: usize, limit: usize },
    #[error("transaction buffer holds {entries} entries, limit is {limit}")]
    TxnTooLarge { entries: usize, limit: usize },
    #[error("safe point registry error: {0}")]
    SafePoint(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// True for errors after which the caller should restart from `begin`.
    pub fn is_retryable_txn(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::GcExpired { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
