use std::sync::Arc;

use cvm_abi::{CodeId, ContractId, DeployContractCodeMessage, ResultEvent, Transaction, VmMessage};
use cvm_store::{Backend, CacheStore, ContractRepository, SharedRepository};
use cvm_wasm::ContractEngine;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::executor::{ContractExecutor, DispatchRecord, ExecutionLog};

/// Result of a transaction that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxReceipt {
    pub gas_remaining: u64,
    pub events: Vec<ResultEvent>,
    /// Code ids assigned by deploy messages, in message order.
    pub code_ids: Vec<CodeId>,
    /// Contracts created by initialize messages, in message order.
    pub contracts: Vec<ContractId>,
    pub trace: Vec<DispatchRecord>,
}

/// Applies transactions to a cache store.
///
/// A transaction's writes stay pending in the store until [`TxRunner::commit`]; a failing
/// transaction rolls back every pending write before its error is returned.
pub struct TxRunner<B: Backend> {
    store: Arc<CacheStore<B>>,
    executor: ContractExecutor,
    config: KernelConfig,
}

impl<B: Backend + 'static> TxRunner<B> {
    pub fn new(store: Arc<CacheStore<B>>, config: KernelConfig) -> Result<Self, KernelError> {
        let engine = Arc::new(ContractEngine::new()?);
        Ok(Self::with_engine(store, engine, config))
    }

    /// Shares an engine (and its module cache) between runners.
    pub fn with_engine(
        store: Arc<CacheStore<B>>,
        engine: Arc<ContractEngine>,
        config: KernelConfig,
    ) -> Self {
        Self {
            store,
            executor: ContractExecutor::new(engine, config.host_costs),
            config,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<B>> {
        &self.store
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn run_transaction(&self, tx: &Transaction) -> Result<TxReceipt, KernelError> {
        match self.apply(tx) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                log::warn!(
                    "rolling back {} pending writes: {err}",
                    self.store.pending_writes()
                );
                self.store.rollback();
                Err(err)
            }
        }
    }

    /// Decodes a CBOR envelope and runs it.
    pub fn run_encoded(&self, bytes: &[u8]) -> Result<TxReceipt, KernelError> {
        let tx = Transaction::decode(bytes)?;
        self.run_transaction(&tx)
    }

    pub fn commit(&self) -> Result<(), KernelError> {
        self.store.commit()?;
        Ok(())
    }

    fn apply(&self, tx: &Transaction) -> Result<TxReceipt, KernelError> {
        let repository: SharedRepository = self.store.clone();
        let state: Arc<[u8]> = Arc::from(tx.state.as_slice());
        let mut log = ExecutionLog::default();
        let mut receipt = TxReceipt::default();
        let mut gas = tx.gas_limit;

        for (index, message) in tx.messages.iter().enumerate() {
            log::debug!("message {index} ({}) with {gas} gas", message.kind());
            gas = match message {
                VmMessage::Deploy(deploy) => {
                    let (code_id, left) = self.deploy(&repository, deploy, gas)?;
                    receipt.code_ids.push(code_id);
                    left
                }
                VmMessage::Initialize(init) => {
                    let (contract, left) = self.executor.create_contract(
                        &repository,
                        &state,
                        init.code_id,
                        init.args.clone(),
                        init.sender.clone(),
                        gas,
                        &mut log,
                    )?;
                    receipt.contracts.push(contract);
                    left
                }
                VmMessage::Call(call) => {
                    self.executor
                        .run_contract(&repository, &state, call.clone(), gas, &mut log)?
                }
            };
            if gas == 0 {
                return Err(KernelError::GasExhausted);
            }
        }

        receipt.gas_remaining = gas;
        receipt.events = log.events;
        receipt.trace = log.trace;
        Ok(receipt)
    }

    fn deploy(
        &self,
        repository: &SharedRepository,
        deploy: &DeployContractCodeMessage,
        gas: u64,
    ) -> Result<(CodeId, u64), KernelError> {
        let cost = self
            .config
            .deploy_gas_per_byte
            .saturating_mul(deploy.code.len() as u64);
        if cost > gas {
            return Err(KernelError::InsufficientGas {
                required: cost,
                available: gas,
            });
        }
        if self.config.enforce_determinism {
            let verdict = cvm_wasm_check::check(&deploy.code)?;
            if !verdict.is_deterministic() {
                return Err(KernelError::Nondeterministic(verdict));
            }
        }
        if self.config.validate_on_deploy {
            self.executor
                .engine()
                .validate(&deploy.code)
                .map_err(|err| KernelError::InvalidCode(format!("{err:#}")))?;
        }
        let code_id = repository.store_code(&deploy.code)?;
        log::debug!(
            "{} deployed code {code_id} ({} bytes, {cost} gas)",
            deploy.sender,
            deploy.code.len()
        );
        Ok((code_id, gas - cost))
    }
}
