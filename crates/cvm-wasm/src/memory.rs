//! Moves length-prefixed buffers across the guest boundary.

use anyhow::{Context, Result, bail};
use wasmtime::{AsContext, AsContextMut, Caller, Extern, Instance, Memory, Store, TypedFunc};

use crate::host::HostState;

pub(crate) const MEMORY_EXPORT: &str = "memory";
pub(crate) const ALLOC_EXPORT: &str = "__new";
/// Alignment id passed to `__new`; the host only ever asks for plain byte buffers.
const ALLOC_ALIGN: i32 = 1;
const LENGTH_PREFIX: usize = 4;

/// Guest `memory` plus its `__new` allocator, if exported.
#[derive(Clone)]
pub(crate) struct GuestMemory {
    memory: Memory,
    alloc: Option<TypedFunc<(i32, i32), i32>>,
}

impl GuestMemory {
    pub fn from_instance(store: &mut Store<HostState>, instance: &Instance) -> Result<Self> {
        let memory = instance
            .get_memory(&mut *store, MEMORY_EXPORT)
            .context("wasm export 'memory' not found")?;
        let alloc = instance
            .get_typed_func::<(i32, i32), i32>(&mut *store, ALLOC_EXPORT)
            .ok();
        Ok(Self { memory, alloc })
    }

    pub fn from_caller(caller: &mut Caller<'_, HostState>) -> Result<Self> {
        let memory = caller
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .context("wasm export 'memory' not found")?;
        let alloc = caller
            .get_export(ALLOC_EXPORT)
            .and_then(Extern::into_func)
            .and_then(|func| func.typed::<(i32, i32), i32>(&*caller).ok());
        Ok(Self { memory, alloc })
    }

    /// Reads the buffer at `ptr`, whose length sits in the four bytes before it.
    pub fn read(&self, store: impl AsContext, ptr: i32) -> Result<Vec<u8>> {
        let store = store.as_context();
        let offset = u32::try_from(ptr).context("negative guest pointer")? as usize;
        let header = offset
            .checked_sub(LENGTH_PREFIX)
            .context("guest pointer has no room for a length header")?;
        let mut len = [0u8; LENGTH_PREFIX];
        self.memory
            .read(&store, header, &mut len)
            .context("read guest buffer length")?;
        let len = u32::from_le_bytes(len) as usize;
        if offset.saturating_add(len) > self.memory.data_size(&store) {
            bail!("guest buffer at {offset} with length {len} is out of bounds");
        }
        let mut data = vec![0u8; len];
        self.memory
            .read(&store, offset, &mut data)
            .context("read guest buffer")?;
        Ok(data)
    }

    pub fn read_legacy_string(&self, store: impl AsContext, ptr: i32) -> Result<String> {
        Ok(decode_legacy_string(&self.read(store, ptr)?))
    }

    /// Allocates through `__new` and copies `bytes` in. The allocator writes the header.
    pub fn write(&self, mut store: impl AsContextMut, bytes: &[u8]) -> Result<i32> {
        let alloc = self
            .alloc
            .as_ref()
            .context("wasm export '__new' not found")?;
        let len = i32::try_from(bytes.len()).context("buffer too large for wasm32")?;
        let ptr = alloc.call(&mut store, (len, ALLOC_ALIGN))?;
        let offset = u32::try_from(ptr).context("allocator returned a negative pointer")? as usize;
        self.memory
            .write(&mut store, offset, bytes)
            .context("write guest buffer")?;
        Ok(ptr)
    }
}

/// Guests pass strings as two bytes per character; keep the low byte of each pair.
pub(crate) fn decode_legacy_string(bytes: &[u8]) -> String {
    let narrow: Vec<u8> = bytes.iter().step_by(2).copied().collect();
    String::from_utf8_lossy(&narrow).into_owned()
}
