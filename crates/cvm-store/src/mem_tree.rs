use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::{Backend, Checkpoint, RootHash, StoreResult, VersionedBackend};

/// In-memory versioned tree. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemTree {
    inner: Arc<RwLock<TreeState>>,
}

#[derive(Default)]
struct TreeState {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    latest: u64,
    roots: BTreeMap<u64, RootHash>,
}

impl std::fmt::Debug for MemTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read().unwrap();
        f.debug_struct("MemTree")
            .field("entries", &state.entries.len())
            .field("latest", &state.latest)
            .finish()
    }
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last checkpointed version, 0 before the first checkpoint.
    pub fn latest_version(&self) -> u64 {
        self.inner.read().unwrap().latest
    }

    pub fn root_hash(&self, version: u64) -> Option<RootHash> {
        self.inner.read().unwrap().roots.get(&version).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TreeState {
    fn hash(&self, version: u64) -> RootHash {
        let mut hasher = Sha256::new();
        hasher.update(version.to_le_bytes());
        for (key, value) in &self.entries {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        let digest: [u8; 32] = hasher.finalize().into();
        RootHash::from(digest)
    }
}

impl Backend for MemTree {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.read().unwrap().entries.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.inner
            .write()
            .unwrap()
            .entries
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StoreResult<()> {
        self.inner.write().unwrap().entries.remove(key);
        Ok(())
    }
}

impl VersionedBackend for MemTree {
    fn working_version(&self) -> u64 {
        self.latest_version() + 1
    }

    fn save_version(&mut self) -> StoreResult<Checkpoint> {
        let mut state = self.inner.write().unwrap();
        let version = state.latest + 1;
        let hash = state.hash(version);
        state.latest = version;
        state.roots.insert(version, hash);
        Ok(Checkpoint { version, hash })
    }
}
