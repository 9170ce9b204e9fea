//! Host imports exposed to contracts and the per-invocation state behind them.

use std::sync::Arc;

use anyhow::{Context, Result};
use cvm_abi::{
    ABORT, CONTRACT_CALL, CONTRACT_CREATE, CodeId, ContractId, ContractMessage, DB_LOAD, DB_SAVE,
    ENV_NAMESPACE, EVENT_EMIT, INIT_METHOD, RUNTIME_NAMESPACE, ResultEvent,
};
use cvm_store::{ContractRepository, SharedRepository};
use serde::{Deserialize, Serialize};
use wasmtime::{Caller, Linker, Trap};

use crate::error::GuestAbort;
use crate::memory::GuestMemory;

/// `db.load` returns this when the key was never written.
const NULL_PTR: i32 = 0;

/// Fuel charged by every host import except `abort`: `base + per_byte * bytes moved`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCosts {
    pub base: u64,
    pub per_byte: u64,
}

impl Default for HostCosts {
    fn default() -> Self {
        Self {
            base: 50,
            per_byte: 1,
        }
    }
}

impl HostCosts {
    pub const fn free() -> Self {
        Self {
            base: 0,
            per_byte: 0,
        }
    }

    pub fn cost(&self, bytes: usize) -> u64 {
        self.base
            .saturating_add(self.per_byte.saturating_mul(bytes as u64))
    }
}

/// What a single invocation is bound to.
#[derive(Clone)]
pub struct InvocationContext {
    /// The executing contract; entity access is scoped to it and it is the sender of its calls.
    pub contract: ContractId,
    /// Opaque transaction state handed to every method and mixed into derived ids.
    pub state: Arc<[u8]>,
    pub repository: SharedRepository,
    pub costs: HostCosts,
}

/// Store data for one instance. Calls and events are collected here and handed back to the
/// caller when the method returns.
pub(crate) struct HostState {
    pub(crate) ctx: InvocationContext,
    pub(crate) calls: Vec<ContractMessage>,
    pub(crate) events: Vec<ResultEvent>,
}

impl HostState {
    pub(crate) fn new(ctx: InvocationContext) -> Self {
        Self {
            ctx,
            calls: Vec::new(),
            events: Vec::new(),
        }
    }

    fn create_contract(&mut self, code_id: CodeId, args: Vec<u8>) -> Result<ContractId> {
        let contract = self
            .ctx
            .repository
            .register_contract(&self.ctx.state, code_id)?;
        log::info!(
            "{} created contract {contract} from code {code_id}",
            self.ctx.contract
        );
        self.calls.push(ContractMessage::new(
            contract.clone(),
            INIT_METHOD,
            args,
            self.ctx.contract.clone(),
        ));
        Ok(contract)
    }
}

pub(crate) fn define_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(RUNTIME_NAMESPACE, DB_SAVE, db_save)?;
    linker.func_wrap(RUNTIME_NAMESPACE, DB_LOAD, db_load)?;
    linker.func_wrap(RUNTIME_NAMESPACE, CONTRACT_CALL, contract_call)?;
    linker.func_wrap(RUNTIME_NAMESPACE, CONTRACT_CREATE, contract_create)?;
    linker.func_wrap(RUNTIME_NAMESPACE, EVENT_EMIT, event_emit)?;
    linker.func_wrap(ENV_NAMESPACE, ABORT, abort)?;
    Ok(())
}

fn charge(caller: &mut Caller<'_, HostState>, bytes: usize) -> Result<()> {
    let cost = caller.data().ctx.costs.cost(bytes);
    if cost == 0 {
        return Ok(());
    }
    let fuel = caller.get_fuel()?;
    if fuel < cost {
        caller.set_fuel(0)?;
        return Err(Trap::OutOfFuel.into());
    }
    caller.set_fuel(fuel - cost)?;
    Ok(())
}

fn db_save(mut caller: Caller<'_, HostState>, key_ptr: i32, data_ptr: i32) -> Result<()> {
    let memory = GuestMemory::from_caller(&mut caller)?;
    let key = memory.read_legacy_string(&caller, key_ptr)?;
    let data = memory.read(&caller, data_ptr)?;
    charge(&mut caller, key.len() + data.len())?;
    let ctx = &caller.data().ctx;
    ctx.repository.save_entity(&ctx.contract, &key, &data)?;
    Ok(())
}

fn db_load(mut caller: Caller<'_, HostState>, key_ptr: i32) -> Result<i32> {
    let memory = GuestMemory::from_caller(&mut caller)?;
    let key = memory.read_legacy_string(&caller, key_ptr)?;
    let ctx = &caller.data().ctx;
    let loaded = ctx.repository.load_entity(&ctx.contract, &key)?;
    charge(&mut caller, key.len() + loaded.as_ref().map_or(0, Vec::len))?;
    match loaded {
        Some(data) => memory.write(&mut caller, &data),
        None => Ok(NULL_PTR),
    }
}

fn contract_call(
    mut caller: Caller<'_, HostState>,
    contract_ptr: i32,
    method_ptr: i32,
    args_ptr: i32,
) -> Result<()> {
    let memory = GuestMemory::from_caller(&mut caller)?;
    let target = memory.read_legacy_string(&caller, contract_ptr)?;
    let method = memory.read_legacy_string(&caller, method_ptr)?;
    let args = memory.read(&caller, args_ptr)?;
    charge(&mut caller, target.len() + method.len() + args.len())?;
    let host = caller.data_mut();
    log::debug!("{} queued call {target}.{method}", host.ctx.contract);
    let message = ContractMessage::new(target, method, args, host.ctx.contract.clone());
    host.calls.push(message);
    Ok(())
}

fn contract_create(mut caller: Caller<'_, HostState>, code_id: i64, args_ptr: i32) -> Result<i32> {
    let memory = GuestMemory::from_caller(&mut caller)?;
    let args = memory.read(&caller, args_ptr)?;
    let code_id = CodeId::try_from(code_id).context("negative code id")?;
    charge(&mut caller, args.len())?;
    let contract = caller.data_mut().create_contract(code_id, args)?;
    memory.write(&mut caller, contract.as_str().as_bytes())
}

fn event_emit(mut caller: Caller<'_, HostState>, name_ptr: i32, data_ptr: i32) -> Result<()> {
    let memory = GuestMemory::from_caller(&mut caller)?;
    let name = memory.read_legacy_string(&caller, name_ptr)?;
    let data = memory.read_legacy_string(&caller, data_ptr)?;
    charge(&mut caller, name.len() + data.len())?;
    let host = caller.data_mut();
    let event = ResultEvent::new(host.ctx.contract.clone(), name, data);
    host.events.push(event);
    Ok(())
}

fn abort(
    mut caller: Caller<'_, HostState>,
    message_ptr: i32,
    file_ptr: i32,
    line: i32,
    column: i32,
) -> Result<()> {
    let (message, file) = match GuestMemory::from_caller(&mut caller) {
        Ok(memory) => (
            memory
                .read_legacy_string(&caller, message_ptr)
                .unwrap_or_default(),
            memory
                .read_legacy_string(&caller, file_ptr)
                .unwrap_or_default(),
        ),
        Err(_) => Default::default(),
    };
    // guests pass unsigned line/column through i32 params
    Err(GuestAbort {
        message,
        file,
        line: line as u32,
        column: column as u32,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn costs_scale_with_bytes() {
        let costs = HostCosts::default();
        assert_eq!(costs.cost(0), 50);
        assert_eq!(costs.cost(10), 60);
        assert_eq!(HostCosts::free().cost(1 << 20), 0);
        let steep = HostCosts {
            base: u64::MAX,
            per_byte: u64::MAX,
        };
        assert_eq!(steep.cost(2), u64::MAX);
    }

    #[test]
    fn costs_deserialize_with_defaults() {
        let costs: HostCosts = serde_json::from_str(r#"{"per_byte": 4}"#).unwrap();
        assert_eq!(costs, HostCosts { base: 50, per_byte: 4 });
    }
}
