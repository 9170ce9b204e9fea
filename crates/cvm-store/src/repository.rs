use std::sync::Arc;

use cvm_abi::{CodeId, ContractId};

use crate::cache::{CacheStore, Overlay};
use crate::keys::{
    NEXT_CODE_ID_KEY, TOTAL_CONTRACTS_KEY, code_key, entity_key, initialized_key, module_key,
};
use crate::{Backend, StoreError, StoreResult};

pub type SharedRepository = Arc<dyn ContractRepository>;

const INITIALIZED_FLAG: &[u8] = &[0x01];

/// Contract bookkeeping used by the sandbox and the runner.
///
/// Every method goes through the same write-set, so counters, code pointers and entity data
/// commit or roll back together.
pub trait ContractRepository: Send + Sync {
    /// Writes `data` into the contract's entity namespace.
    fn save_entity(&self, contract: &ContractId, key: &str, data: &[u8]) -> StoreResult<()>;
    /// `None` when the key was never written (or was removed).
    fn load_entity(&self, contract: &ContractId, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Stores code under the next code id and advances the counter.
    fn store_code(&self, code: &[u8]) -> StoreResult<CodeId>;
    fn next_code_id(&self) -> StoreResult<CodeId>;
    fn code_by_id(&self, code_id: CodeId) -> StoreResult<Vec<u8>>;

    /// Registers the code pointer of a new contract. Fails if the id is taken.
    fn create_contract(&self, code_id: CodeId, contract: &ContractId) -> StoreResult<()>;
    fn code_id_of(&self, contract: &ContractId) -> StoreResult<CodeId>;
    fn code_by_contract(&self, contract: &ContractId) -> StoreResult<Vec<u8>> {
        self.code_by_id(self.code_id_of(contract)?)
    }

    fn total_contracts(&self) -> StoreResult<u64>;
    /// Returns the current total-contract counter and increments it.
    fn next_contract_salt(&self) -> StoreResult<u64>;

    /// Derives a fresh id from `state`, the code id and the next salt, then registers it.
    fn register_contract(&self, state: &[u8], code_id: CodeId) -> StoreResult<ContractId> {
        let salt = self.next_contract_salt()?;
        let contract = ContractId::derive(state, code_id, salt);
        self.create_contract(code_id, &contract)?;
        Ok(contract)
    }

    /// Sets the initialized flag, failing without any write if it is already set.
    fn try_initialize(&self, contract: &ContractId) -> StoreResult<()>;
    fn is_initialized(&self, contract: &ContractId) -> StoreResult<bool>;
}

impl<B: Backend> Overlay<B> {
    fn counter(&self, key: &str) -> StoreResult<u64> {
        let Some(raw) = self.get(key.as_bytes())? else {
            return Ok(0);
        };
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| StoreError::CorruptCounter {
                key: key.to_string(),
                value: String::from_utf8_lossy(&raw).into_owned(),
            })
    }

    fn bump(&mut self, key: &str) -> StoreResult<u64> {
        let current = self.counter(key)?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::CorruptCounter {
                key: key.to_string(),
                value: current.to_string(),
            })?;
        self.set(key.as_bytes(), next.to_string().as_bytes());
        Ok(current)
    }
}

impl<B: Backend> ContractRepository for CacheStore<B> {
    fn save_entity(&self, contract: &ContractId, key: &str, data: &[u8]) -> StoreResult<()> {
        self.lock().set(&entity_key(contract, key), data);
        Ok(())
    }

    fn load_entity(&self, contract: &ContractId, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.lock().get(&entity_key(contract, key))
    }

    fn store_code(&self, code: &[u8]) -> StoreResult<CodeId> {
        let mut overlay = self.lock();
        let code_id = overlay.bump(NEXT_CODE_ID_KEY)?;
        overlay.set(&code_key(code_id), code);
        log::info!("stored {} bytes of code as id {code_id}", code.len());
        Ok(code_id)
    }

    fn next_code_id(&self) -> StoreResult<CodeId> {
        self.lock().counter(NEXT_CODE_ID_KEY)
    }

    fn code_by_id(&self, code_id: CodeId) -> StoreResult<Vec<u8>> {
        self.lock()
            .get(&code_key(code_id))?
            .ok_or(StoreError::CodeNotFound(code_id))
    }

    fn create_contract(&self, code_id: CodeId, contract: &ContractId) -> StoreResult<()> {
        let mut overlay = self.lock();
        let key = module_key(contract);
        if overlay.has(&key)? {
            return Err(StoreError::ContractExists(contract.clone()));
        }
        if !overlay.has(&code_key(code_id))? {
            return Err(StoreError::CodeNotFound(code_id));
        }
        overlay.set(&key, code_id.to_string().as_bytes());
        Ok(())
    }

    fn code_id_of(&self, contract: &ContractId) -> StoreResult<CodeId> {
        let pointer = self
            .lock()
            .get(&module_key(contract))?
            .ok_or_else(|| StoreError::ContractNotFound(contract.clone()))?;
        std::str::from_utf8(&pointer)
            .ok()
            .and_then(|text| text.parse::<CodeId>().ok())
            .ok_or_else(|| StoreError::CorruptPointer(contract.clone()))
    }

    fn total_contracts(&self) -> StoreResult<u64> {
        self.lock().counter(TOTAL_CONTRACTS_KEY)
    }

    fn next_contract_salt(&self) -> StoreResult<u64> {
        self.lock().bump(TOTAL_CONTRACTS_KEY)
    }

    fn try_initialize(&self, contract: &ContractId) -> StoreResult<()> {
        let mut overlay = self.lock();
        let key = initialized_key(contract);
        if overlay.has(&key)? {
            return Err(StoreError::AlreadyInitialized(contract.clone()));
        }
        overlay.set(&key, INITIALIZED_FLAG);
        Ok(())
    }

    fn is_initialized(&self, contract: &ContractId) -> StoreResult<bool> {
        self.lock().has(&initialized_key(contract))
    }
}
