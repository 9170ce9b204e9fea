use cvm_abi::{ContractMessage, ResultEvent};
use wasmtime::{Instance, Module, Store};

use crate::ContractEngine;
use crate::error::{ExecutionError, classify};
use crate::host::{HostState, InvocationContext};
use crate::memory::GuestMemory;

/// What a finished invocation leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub gas_remaining: u64,
    /// Messages the contract queued with `contract.call` and `contract.create`, in order.
    pub calls: Vec<ContractMessage>,
    pub events: Vec<ResultEvent>,
}

/// One instance of a contract module, bound to a contract id and a gas budget.
///
/// A runtime serves exactly one message; build a new one per dispatch.
pub struct ContractRuntime {
    store: Store<HostState>,
    instance: Instance,
}

impl ContractRuntime {
    pub fn new(
        engine: &ContractEngine,
        module: &Module,
        ctx: InvocationContext,
        gas_limit: u64,
    ) -> Result<Self, ExecutionError> {
        let mut store = Store::new(engine.engine(), HostState::new(ctx));
        store.set_fuel(gas_limit).map_err(classify)?;
        let instance = engine
            .linker()
            .instantiate(&mut store, module)
            .map_err(|err| match classify(err) {
                ExecutionError::Host(msg) => ExecutionError::Instantiate(msg),
                other => other,
            })?;
        Ok(Self { store, instance })
    }

    /// Calls `message.method(statePtr, senderPtr, argsPtr)`.
    ///
    /// Sender, state and args are copied into guest memory through `__new` in that order
    /// before the call.
    pub fn run(mut self, message: &ContractMessage) -> Result<RunOutcome, ExecutionError> {
        let entry = self
            .instance
            .get_func(&mut self.store, &message.method)
            .ok_or_else(|| ExecutionError::MissingExport(message.method.clone()))?
            .typed::<(i32, i32, i32), ()>(&self.store)
            .map_err(|_| ExecutionError::BadSignature(message.method.clone()))?;
        let memory = GuestMemory::from_instance(&mut self.store, &self.instance).map_err(classify)?;

        let state = self.store.data().ctx.state.clone();
        let sender_ptr = memory
            .write(&mut self.store, message.sender.as_str().as_bytes())
            .map_err(classify)?;
        let state_ptr = memory.write(&mut self.store, &state).map_err(classify)?;
        let args_ptr = memory
            .write(&mut self.store, &message.args)
            .map_err(classify)?;

        entry
            .call(&mut self.store, (state_ptr, sender_ptr, args_ptr))
            .map_err(classify)?;

        let gas_remaining = self.store.get_fuel().map_err(classify)?;
        let host = self.store.into_data();
        Ok(RunOutcome {
            gas_remaining,
            calls: host.calls,
            events: host.events,
        })
    }
}
