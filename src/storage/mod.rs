pub mod engine;
pub mod memory;
pub mod mvcc;

pub use engine::{StorageEngine, StorageError};
pub use memory::InMemoryStorage;
pub use mvcc::{Lock, VersionChain, WriteKind, WriteRecord};
