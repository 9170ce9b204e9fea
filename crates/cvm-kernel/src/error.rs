use cvm_wasm_check::{CheckError, Verdict};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] cvm_store::StoreError),
    #[error("contract execution failed: {0}")]
    Execution(#[from] cvm_wasm::ExecutionError),
    #[error("wasm runtime error: {0}")]
    Wasm(#[from] anyhow::Error),
    #[error("transaction decode error: {0}")]
    Decode(#[from] cvm_abi::AbiDecodeError),
    #[error("malformed contract code: {0}")]
    MalformedCode(#[from] CheckError),
    #[error("contract code uses nondeterministic features ({0:?})")]
    Nondeterministic(Verdict),
    #[error("invalid contract code: {0}")]
    InvalidCode(String),
    #[error("insufficient gas for deploy: need {required}, have {available}")]
    InsufficientGas { required: u64, available: u64 },
    #[error("gas exhausted")]
    GasExhausted,
}
