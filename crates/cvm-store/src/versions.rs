//! Maps externally supplied ids (block heights, batch numbers) to tree versions.

use crate::keys::version_key;
use crate::{Checkpoint, StoreError, StoreResult, VersionedBackend};

/// Records `id -> working version` inside the tree, then checkpoints it.
pub fn save_version_with_id<B: VersionedBackend>(
    backend: &mut B,
    id: u64,
) -> StoreResult<Checkpoint> {
    let version = backend.working_version();
    backend.set(&version_key(id), &version.to_be_bytes())?;
    let checkpoint = backend.save_version()?;
    log::info!(
        "saved version {} for id {id} (root {})",
        checkpoint.version,
        checkpoint.hash
    );
    Ok(checkpoint)
}

pub fn version_by_id<B: VersionedBackend>(backend: &B, id: u64) -> StoreResult<u64> {
    let bytes = backend
        .get(&version_key(id))?
        .ok_or(StoreError::VersionNotFound(id))?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::CorruptVersion(id))?;
    Ok(u64::from_be_bytes(raw))
}
