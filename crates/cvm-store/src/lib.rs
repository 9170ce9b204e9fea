//! Durable-tree abstractions, the transactional cache overlay and contract bookkeeping on top.

mod cache;
pub mod keys;
mod mem_tree;
mod repository;
pub mod versions;

pub use cache::CacheStore;
pub use mem_tree::MemTree;
pub use repository::{ContractRepository, SharedRepository};
pub use versions::{save_version_with_id, version_by_id};

use cvm_abi::{CodeId, ContractId};
use std::fmt;

pub type StoreResult<T> = Result<T, StoreError>;

/// Byte-keyed durable storage the overlay flushes into.
pub trait Backend: Send {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;
    fn remove(&mut self, key: &[u8]) -> StoreResult<()>;
}

/// Backend that can checkpoint its contents into numbered, hashed versions.
pub trait VersionedBackend: Backend {
    /// Version the next checkpoint will receive.
    fn working_version(&self) -> u64;
    fn save_version(&mut self) -> StoreResult<Checkpoint>;
}

/// Result of checkpointing a versioned backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub version: u64,
    pub hash: RootHash,
}

/// SHA-256 content hash of a checkpointed tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootHash([u8; 32]);

impl RootHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for RootHash {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for RootHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RootHash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for RootHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("contract code not found for id: {0}")]
    CodeNotFound(CodeId),
    #[error("contract does not exist: {0}")]
    ContractNotFound(ContractId),
    #[error("contract already exists: {0}")]
    ContractExists(ContractId),
    #[error("contract already initialized: {0}")]
    AlreadyInitialized(ContractId),
    #[error("counter '{key}' holds a non-numeric value {value:?}")]
    CorruptCounter { key: String, value: String },
    #[error("code pointer of contract {0} is not a code id")]
    CorruptPointer(ContractId),
    #[error("version not found for id {0}")]
    VersionNotFound(u64),
    #[error("version record for id {0} is not an 8-byte integer")]
    CorruptVersion(u64),
}
