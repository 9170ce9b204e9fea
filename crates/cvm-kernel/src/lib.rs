//! Transaction execution: deploys code, creates contracts and drains contract calls over a
//! shared cache store.

pub mod config;
pub mod error;
pub mod executor;
pub mod queue;
pub mod runner;

pub use config::KernelConfig;
pub use error::KernelError;
pub use executor::{ContractExecutor, DispatchRecord, ExecutionLog};
pub use queue::CallbackQueue;
pub use runner::{TxReceipt, TxRunner};
