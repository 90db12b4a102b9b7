//! Tessera: a transactional client for a range-partitioned, multi-versioned
//! key-value store.
//!
//! Transactions read from a snapshot at their start timestamp, buffer writes
//! locally and publish them with Percolator-style two-phase commit. Routing,
//! retries and lock resolution happen underneath; callers only see
//! conflicts, GC expiry, aborts and fatal errors.

pub mod backoff;
pub mod config;
pub mod error;
pub mod lock_resolver;
pub mod mock;
pub mod oracle;
pub mod region_cache;
pub mod rpc;
pub mod safepoint;
pub mod scanner;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod types;

pub use config::{RetryConfig, SafePointBackend, SafePointConfig, TesseraConfig, TxnLimits};
pub use error::{ConflictReason, Error, Result, RetryReason};
pub use mock::{Fault, FaultRule, MockCluster};
pub use rpc::service::tessera_kv_server::{TesseraKv, TesseraKvServer};
pub use rpc::service::tessera_pd_server::{TesseraPd, TesseraPdServer};
pub use scanner::Scanner;
pub use snapshot::Snapshot;
pub use store::{Backends, KvStore};
pub use transaction::{CommitReceipt, Transaction, TransactionState, UnionIter};
pub use types::{Key, KvPair, Region, Timestamp, Value};
