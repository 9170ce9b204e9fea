//! Deterministic WASM sandbox that runs contract methods against a repository.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use wasmtime::{Config, Engine, Linker, Module};

mod error;
mod host;
mod memory;
mod runtime;

pub use error::{ExecutionError, GuestAbort};
pub use host::{HostCosts, InvocationContext};
pub use runtime::{ContractRuntime, RunOutcome};

use host::HostState;

/// Compiled modules kept by [`ContractEngine::new`].
pub const DEFAULT_MODULE_CACHE_CAPACITY: usize = 256;

/// Compiles contract code and hands out runtimes.
///
/// Fuel metering is always on, floats are NaN-canonicalized and threads and SIMD are
/// refused at compile time. Compiled modules are cached by code hash; once the cache
/// holds `capacity` modules the oldest insertion is evicted.
pub struct ContractEngine {
    engine: Engine,
    linker: Linker<HostState>,
    module_cache: Mutex<IndexMap<ModuleKey, Arc<Module>>>,
    capacity: usize,
}

impl ContractEngine {
    pub fn new() -> Result<Self> {
        Self::with_cache_capacity(DEFAULT_MODULE_CACHE_CAPACITY)
    }

    /// Same engine, keeping at most `capacity` compiled modules (minimum one).
    pub fn with_cache_capacity(capacity: usize) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.consume_fuel(true);
        cfg.wasm_threads(false);
        cfg.wasm_relaxed_simd(false);
        cfg.wasm_simd(false);
        cfg.debug_info(false);
        cfg.cranelift_nan_canonicalization(true);
        let engine = Engine::new(&cfg)?;
        let mut linker = Linker::new(&engine);
        host::define_host_functions(&mut linker)?;
        Ok(Self {
            engine,
            linker,
            module_cache: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Checks that `wasm` would compile under this engine's feature set.
    pub fn validate(&self, wasm: &[u8]) -> Result<()> {
        Module::validate(&self.engine, wasm)
    }

    pub fn compile(&self, wasm: &[u8]) -> Result<Module> {
        Module::new(&self.engine, wasm)
    }

    /// Obtain (and cache) a compiled module for the given code.
    pub fn cached_module(&self, wasm: &[u8]) -> Result<Arc<Module>> {
        let key = ModuleKey::from_bytes(wasm);
        if let Some(existing) = self.get_cached_module(&key) {
            return Ok(existing);
        }
        let compiled = Arc::new(self.compile(wasm)?);
        log::debug!("compiled contract module ({} bytes)", wasm.len());
        let mut cache = self.module_cache.lock().expect("module cache poisoned");
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }
        while cache.len() >= self.capacity {
            cache.shift_remove_index(0);
        }
        cache.insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Instantiates `module` for one invocation with `gas_limit` fuel.
    pub fn runtime(
        &self,
        module: &Module,
        ctx: InvocationContext,
        gas_limit: u64,
    ) -> Result<ContractRuntime, ExecutionError> {
        ContractRuntime::new(self, module, ctx, gas_limit)
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn linker(&self) -> &Linker<HostState> {
        &self.linker
    }

    fn get_cached_module(&self, key: &ModuleKey) -> Option<Arc<Module>> {
        self.module_cache
            .lock()
            .expect("module cache poisoned")
            .get(key)
            .cloned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ModuleKey([u8; 32]);

impl ModuleKey {
    fn from_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

#[cfg(test)]
impl ContractEngine {
    fn cached_module_count(&self) -> usize {
        self.module_cache
            .lock()
            .expect("module cache poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_abi::{ContractId, ContractMessage, ResultEvent};
    use cvm_store::{CacheStore, ContractRepository, MemTree, SharedRepository};
    use cvm_testkit::{COUNTER_KEY, OWNER_KEY, PROBE_KEY, test_contract};

    const GAS: u64 = 1_000_000;

    struct Harness {
        engine: ContractEngine,
        repo: Arc<CacheStore<MemTree>>,
        module: Arc<Module>,
        contract: ContractId,
    }

    impl Harness {
        fn new() -> Self {
            let engine = ContractEngine::new().unwrap();
            let module = engine.cached_module(&test_contract()).unwrap();
            Self {
                engine,
                repo: Arc::new(CacheStore::new(MemTree::new())),
                module,
                contract: ContractId::new("contract-a"),
            }
        }

        fn ctx(&self, costs: HostCosts) -> InvocationContext {
            let repository: SharedRepository = self.repo.clone();
            InvocationContext {
                contract: self.contract.clone(),
                state: Arc::from(&b"tx-state"[..]),
                repository,
                costs,
            }
        }

        fn run_with(
            &self,
            method: &str,
            args: &[u8],
            gas: u64,
            costs: HostCosts,
        ) -> Result<RunOutcome, ExecutionError> {
            let message =
                ContractMessage::new(self.contract.clone(), method, args.to_vec(), "alice");
            self.engine
                .runtime(&self.module, self.ctx(costs), gas)?
                .run(&message)
        }

        fn run(&self, method: &str, args: &[u8]) -> Result<RunOutcome, ExecutionError> {
            self.run_with(method, args, GAS, HostCosts::default())
        }

        fn entity(&self, key: &str) -> Option<Vec<u8>> {
            self.repo.load_entity(&self.contract, key).unwrap()
        }
    }

    #[test]
    fn counter_persists_between_invocations() {
        let h = Harness::new();
        let first = h.run("addOne", b"").unwrap();
        assert!(first.gas_remaining < GAS);
        assert!(first.calls.is_empty());
        h.run("addOne", b"").unwrap();
        assert_eq!(h.entity(COUNTER_KEY), Some(2i32.to_le_bytes().to_vec()));
    }

    #[test]
    fn method_sees_the_sender() {
        let h = Harness::new();
        h.run("init", b"").unwrap();
        assert_eq!(h.entity(OWNER_KEY), Some(b"alice".to_vec()));
    }

    #[test]
    fn abort_is_reported_with_location() {
        let h = Harness::new();
        let err = h.run("crash", b"").unwrap_err();
        assert_eq!(
            err,
            ExecutionError::Abort(GuestAbort {
                message: "crash".into(),
                file: "index.ts".into(),
                line: 12,
                column: 5,
            })
        );
        assert_eq!(
            err.to_string(),
            "WASM called abort msg: crash, file: index.ts, line: 12, column: 5"
        );
    }

    #[test]
    fn infinite_loop_runs_out_of_fuel() {
        let h = Harness::new();
        let err = h.run_with("infiniteLoop", b"", 20_000, HostCosts::default()).unwrap_err();
        assert!(err.is_out_of_fuel(), "unexpected error: {err}");
    }

    #[test]
    fn host_calls_are_charged() {
        let h = Harness::new();
        let free = h.run_with("emitEvent", b"", GAS, HostCosts::free()).unwrap();
        let paid = h.run_with("emitEvent", b"", GAS, HostCosts::default()).unwrap();
        // "event" + "data" after narrowing
        assert_eq!(free.gas_remaining - paid.gas_remaining, 50 + 9);

        let steep = HostCosts {
            base: GAS * 2,
            per_byte: 0,
        };
        let err = h.run_with("emitEvent", b"", GAS, steep).unwrap_err();
        assert!(err.is_out_of_fuel());
    }

    #[test]
    fn calls_are_queued_with_the_contract_as_sender() {
        let h = Harness::new();
        let outcome = h.run("callback", b"").unwrap();
        assert_eq!(
            outcome.calls,
            vec![ContractMessage::new(
                "target",
                "method",
                b"args".to_vec(),
                h.contract.clone()
            )]
        );
    }

    #[test]
    fn events_carry_the_emitting_contract() {
        let h = Harness::new();
        let outcome = h.run("emitEvent", b"").unwrap();
        assert_eq!(
            outcome.events,
            vec![ResultEvent::new(h.contract.clone(), "event", "data")]
        );
    }

    #[test]
    fn create_registers_the_child_and_queues_init() {
        let h = Harness::new();
        let code_id = h.repo.store_code(&test_contract()).unwrap();
        let args = code_id.to_le_bytes();
        let outcome = h.run("createContract", &args).unwrap();

        let child = ContractId::new(String::from_utf8(h.entity("child").unwrap()).unwrap());
        assert_eq!(h.repo.code_id_of(&child).unwrap(), code_id);
        assert_eq!(
            outcome.calls,
            vec![ContractMessage::new(
                child.clone(),
                "init",
                args.to_vec(),
                h.contract.clone()
            )]
        );
        assert_eq!(child, ContractId::derive(b"tx-state", code_id, 0));
    }

    #[test]
    fn create_from_unknown_code_fails() {
        let h = Harness::new();
        let err = h.run("createContract", &7u64.to_le_bytes()).unwrap_err();
        assert!(matches!(err, ExecutionError::Host(msg) if msg.contains("not found for id: 7")));
    }

    #[test]
    fn load_tells_missing_from_empty() {
        let h = Harness::new();
        let probe = |h: &Harness| h.run("probe", b"").unwrap().events[0].data.clone();
        assert_eq!(probe(&h), "absent");
        h.repo.save_entity(&h.contract, PROBE_KEY, &[]).unwrap();
        assert_eq!(probe(&h), "empty");
        h.repo.save_entity(&h.contract, PROBE_KEY, &[9]).unwrap();
        assert_eq!(probe(&h), "present");
    }

    #[test]
    fn unknown_and_malformed_methods_are_rejected() {
        let h = Harness::new();
        assert_eq!(
            h.run("nope", b"").unwrap_err(),
            ExecutionError::MissingExport("nope".into())
        );
        assert_eq!(
            h.run("memory", b"").unwrap_err(),
            ExecutionError::MissingExport("memory".into())
        );
        assert_eq!(
            h.run("__new", b"").unwrap_err(),
            ExecutionError::BadSignature("__new".into())
        );
    }

    #[test]
    fn unresolved_imports_fail_instantiation() {
        let engine = ContractEngine::new().unwrap();
        let wasm = wat::parse_str(
            r#"(module (import "runtime" "clock.now" (func (result i64))) (memory (export "memory") 1))"#,
        )
        .unwrap();
        let module = engine.compile(&wasm).unwrap();
        let h = Harness::new();
        let err = engine
            .runtime(&module, h.ctx(HostCosts::default()), GAS)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::Instantiate(_)));
    }

    #[test]
    fn modules_are_cached_by_code() {
        let engine = ContractEngine::new().unwrap();
        let wasm = test_contract();
        let first = engine.cached_module(&wasm).unwrap();
        let second = engine.cached_module(&wasm).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cached_module_count(), 1);
    }

    #[test]
    fn cache_evicts_the_oldest_module() {
        let engine = ContractEngine::with_cache_capacity(2).unwrap();
        let first = wat::parse_str(r#"(module (func (export "a")))"#).unwrap();
        let second = wat::parse_str(r#"(module (func (export "b")))"#).unwrap();
        let third = wat::parse_str(r#"(module (func (export "c")))"#).unwrap();

        let kept = engine.cached_module(&first).unwrap();
        engine.cached_module(&second).unwrap();
        engine.cached_module(&third).unwrap();
        assert_eq!(engine.cached_module_count(), 2);

        // the first module was evicted, so it compiles again
        let again = engine.cached_module(&first).unwrap();
        assert!(!Arc::ptr_eq(&kept, &again));
        assert_eq!(engine.cached_module_count(), 2);
    }

    #[test]
    fn simd_and_threads_do_not_compile() {
        let engine = ContractEngine::new().unwrap();
        let simd = wat::parse_str(r#"(module (func (drop (v128.const i64x2 0 0))))"#).unwrap();
        assert!(engine.validate(&simd).is_err());
        let shared = wat::parse_str(r#"(module (memory 1 1 shared))"#).unwrap();
        assert!(engine.validate(&shared).is_err());
        assert!(engine.validate(&test_contract()).is_ok());
        assert!(engine.validate(b"not wasm").is_err());
    }
}
