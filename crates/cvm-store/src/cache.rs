use std::fmt;
use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;

use crate::{Backend, StoreResult};

/// Pending write recorded in the overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CacheEntry {
    value: Vec<u8>,
    deleted: bool,
}

/// Copy-on-write buffer in front of a durable backend.
///
/// Nothing reaches the backend until [`CacheStore::commit`]; [`CacheStore::rollback`] drops
/// every pending write. Keys are flushed in first-write order so a commit replays
/// identically on every node.
pub struct CacheStore<B> {
    inner: Mutex<Overlay<B>>,
}

pub(crate) struct Overlay<B> {
    backend: B,
    // IndexMap keeps first-touch order across later overwrites of the same key.
    writes: IndexMap<Vec<u8>, CacheEntry>,
}

impl<B: Backend> CacheStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Mutex::new(Overlay {
                backend,
                writes: IndexMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.lock().get(key)
    }

    pub fn has(&self, key: &[u8]) -> StoreResult<bool> {
        self.lock().has(key)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) {
        self.lock().set(key, value);
    }

    pub fn remove(&self, key: &[u8]) {
        self.lock().remove(key);
    }

    /// Number of distinct keys touched since the last commit or rollback.
    pub fn pending_writes(&self) -> usize {
        self.lock().writes.len()
    }

    /// Replays the write-set into the backend in first-write order, then clears it.
    ///
    /// On a backend failure the write-set is left untouched.
    pub fn commit(&self) -> StoreResult<()> {
        let mut overlay = self.lock();
        let Overlay { backend, writes } = &mut *overlay;
        for (key, entry) in writes.iter() {
            if entry.deleted {
                backend.remove(key)?;
            } else {
                backend.set(key, &entry.value)?;
            }
        }
        log::debug!("committed {} cached writes", writes.len());
        writes.clear();
        Ok(())
    }

    pub fn rollback(&self) {
        let mut overlay = self.lock();
        if !overlay.writes.is_empty() {
            log::debug!("discarding {} cached writes", overlay.writes.len());
        }
        overlay.writes.clear();
    }

    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.lock().backend)
    }

    /// Drops any pending writes and hands the backend back.
    pub fn into_backend(self) -> B {
        self.inner
            .into_inner()
            .expect("cache store poisoned")
            .backend
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Overlay<B>> {
        self.inner.lock().expect("cache store poisoned")
    }
}

impl<B> fmt::Debug for CacheStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.lock().map(|o| o.writes.len()).unwrap_or(0);
        f.debug_struct("CacheStore")
            .field("pending_writes", &pending)
            .finish()
    }
}

impl<B: Backend> Overlay<B> {
    pub(crate) fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(entry) if entry.deleted => Ok(None),
            Some(entry) => Ok(Some(entry.value.clone())),
            None => self.backend.get(key),
        }
    }

    pub(crate) fn has(&self, key: &[u8]) -> StoreResult<bool> {
        match self.writes.get(key) {
            Some(entry) => Ok(!entry.deleted),
            None => Ok(self.backend.get(key)?.is_some()),
        }
    }

    pub(crate) fn set(&mut self, key: &[u8], value: &[u8]) {
        self.record(key, value.to_vec(), false);
    }

    pub(crate) fn remove(&mut self, key: &[u8]) {
        self.record(key, Vec::new(), true);
    }

    fn record(&mut self, key: &[u8], value: Vec<u8>, deleted: bool) {
        let entry = CacheEntry { value, deleted };
        match self.writes.get_mut(key) {
            Some(existing) => *existing = entry,
            None => {
                self.writes.insert(key.to_vec(), entry);
            }
        }
    }
}
