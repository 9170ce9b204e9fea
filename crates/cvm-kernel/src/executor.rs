//! Drains a contract call and every call it queues, threading gas through each step.

use std::sync::Arc;

use cvm_abi::{CodeId, ContractId, ContractMessage, INIT_METHOD, ResultEvent};
use cvm_store::{ContractRepository, SharedRepository};
use cvm_wasm::{ContractEngine, HostCosts, InvocationContext};

use crate::error::KernelError;
use crate::queue::CallbackQueue;

/// Gas spent by one dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub contract: ContractId,
    pub method: String,
    pub gas_used: u64,
}

/// Events and dispatch records collected across a transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    pub events: Vec<ResultEvent>,
    pub trace: Vec<DispatchRecord>,
}

pub struct ContractExecutor {
    engine: Arc<ContractEngine>,
    costs: HostCosts,
}

impl ContractExecutor {
    pub fn new(engine: Arc<ContractEngine>, costs: HostCosts) -> Self {
        Self { engine, costs }
    }

    pub fn engine(&self) -> &ContractEngine {
        &self.engine
    }

    /// Runs `seed`, then everything it queues, breadth first. Returns the gas left.
    ///
    /// The first failing message stops the drain; its error is returned and nothing
    /// queued after it runs.
    pub fn run_contract(
        &self,
        repository: &SharedRepository,
        state: &Arc<[u8]>,
        seed: ContractMessage,
        gas: u64,
        log: &mut ExecutionLog,
    ) -> Result<u64, KernelError> {
        let mut queue = CallbackQueue::new();
        queue.enqueue(seed);
        let mut gas = gas;

        while let Some(message) = queue.dequeue() {
            log::debug!(
                "dispatch {}.{} from {} with {gas} gas ({} queued)",
                message.contract,
                message.method,
                message.sender,
                queue.len()
            );
            if message.is_init() {
                repository.try_initialize(&message.contract)?;
            }
            let code = repository.code_by_contract(&message.contract)?;
            let module = self.engine.cached_module(&code)?;
            let ctx = InvocationContext {
                contract: message.contract.clone(),
                state: state.clone(),
                repository: repository.clone(),
                costs: self.costs,
            };
            let outcome = self.engine.runtime(&module, ctx, gas)?.run(&message)?;

            log.trace.push(DispatchRecord {
                contract: message.contract,
                method: message.method,
                gas_used: gas - outcome.gas_remaining,
            });
            gas = outcome.gas_remaining;
            queue.extend(outcome.calls);
            log.events.extend(outcome.events);
        }
        Ok(gas)
    }

    /// Registers a contract from `code_id` and runs its `init` with `args`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_contract(
        &self,
        repository: &SharedRepository,
        state: &Arc<[u8]>,
        code_id: CodeId,
        args: Vec<u8>,
        sender: ContractId,
        gas: u64,
        log: &mut ExecutionLog,
    ) -> Result<(ContractId, u64), KernelError> {
        let contract = repository.register_contract(state, code_id)?;
        log::info!("{sender} created contract {contract} from code {code_id}");
        let init = ContractMessage::new(contract.clone(), INIT_METHOD, args, sender);
        let gas = self.run_contract(repository, state, init, gas, log)?;
        Ok((contract, gas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_store::{CacheStore, ContractRepository, MemTree, StoreError};
    use cvm_testkit::{NEXT_KEY, legacy_string, test_contract};

    const GAS: u64 = 1_000_000;

    fn setup() -> (ContractExecutor, Arc<CacheStore<MemTree>>, SharedRepository) {
        let engine = Arc::new(ContractEngine::new().unwrap());
        let store = Arc::new(CacheStore::new(MemTree::new()));
        let repository: SharedRepository = store.clone();
        (ContractExecutor::new(engine, HostCosts::default()), store, repository)
    }

    fn state() -> Arc<[u8]> {
        Arc::from(&b"state"[..])
    }

    #[test]
    fn create_runs_init_once() {
        let (executor, _, repo) = setup();
        let code_id = repo.store_code(&test_contract()).unwrap();
        let mut log = ExecutionLog::default();
        let (contract, gas) = executor
            .create_contract(&repo, &state(), code_id, vec![], "deployer".into(), GAS, &mut log)
            .unwrap();

        assert!(gas < GAS);
        assert!(repo.is_initialized(&contract).unwrap());
        assert_eq!(log.trace.len(), 1);
        assert_eq!(log.trace[0].method, "init");
        assert_eq!(GAS - gas, log.trace[0].gas_used);

        let again = ContractMessage::new(contract, INIT_METHOD, vec![], "deployer");
        let err = executor
            .run_contract(&repo, &state(), again, gas, &mut log)
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Store(StoreError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn queued_calls_follow_the_caller() {
        let (executor, _, repo) = setup();
        let code_id = repo.store_code(&test_contract()).unwrap();
        let mut log = ExecutionLog::default();
        let (a, gas) = executor
            .create_contract(&repo, &state(), code_id, vec![], "t".into(), GAS, &mut log)
            .unwrap();
        let (b, gas) = executor
            .create_contract(&repo, &state(), code_id, vec![], "t".into(), gas, &mut log)
            .unwrap();
        repo.save_entity(&a, NEXT_KEY, &legacy_string(b.as_str()))
            .unwrap();

        let mut log = ExecutionLog::default();
        let left = executor
            .run_contract(
                &repo,
                &state(),
                ContractMessage::new(a.clone(), "relay", vec![], "t"),
                gas,
                &mut log,
            )
            .unwrap();

        let visited: Vec<_> = log.events.iter().map(|e| e.contract.clone()).collect();
        assert_eq!(visited, vec![a.clone(), b.clone()]);
        let spent: u64 = log.trace.iter().map(|r| r.gas_used).sum();
        assert_eq!(gas - left, spent);
    }

    #[test]
    fn unknown_contract_fails_before_running() {
        let (executor, _, repo) = setup();
        let mut log = ExecutionLog::default();
        let err = executor
            .run_contract(
                &repo,
                &state(),
                ContractMessage::new("ghost", "addOne", vec![], "t"),
                GAS,
                &mut log,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Store(StoreError::ContractNotFound(_))
        ));
        assert!(log.trace.is_empty());
    }

    #[test]
    fn failing_callback_stops_the_drain() {
        let (executor, _, repo) = setup();
        let code_id = repo.store_code(&test_contract()).unwrap();
        let mut log = ExecutionLog::default();
        let (a, gas) = executor
            .create_contract(&repo, &state(), code_id, vec![], "t".into(), GAS, &mut log)
            .unwrap();
        // `callback` targets a contract named "target" that was never created
        let err = executor
            .run_contract(
                &repo,
                &state(),
                ContractMessage::new(a.clone(), "callback", vec![], "t"),
                gas,
                &mut log,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Store(StoreError::ContractNotFound(_))
        ));
        // the caller ran; the queued call failed before producing a record
        assert_eq!(
            log.trace.last().map(|r| r.method.as_str()),
            Some("callback")
        );
    }
}
