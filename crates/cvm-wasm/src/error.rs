use thiserror::Error;
use wasmtime::Trap;

/// Raised by the `env.abort` import. Travels through wasmtime as the host error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("WASM called abort msg: {message}, file: {file}, line: {line}, column: {column}")]
pub struct GuestAbort {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Why a contract invocation did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("wasm export '{0}' not found")]
    MissingExport(String),
    #[error("wasm export '{0}' must have signature (i32, i32, i32) -> ()")]
    BadSignature(String),
    #[error("all fuel consumed by WebAssembly")]
    OutOfFuel,
    #[error(transparent)]
    Abort(#[from] GuestAbort),
    #[error("wasm trap: {0}")]
    Trap(String),
    #[error("instantiation failed: {0}")]
    Instantiate(String),
    #[error("host error: {0}")]
    Host(String),
}

impl ExecutionError {
    pub fn is_out_of_fuel(&self) -> bool {
        matches!(self, ExecutionError::OutOfFuel)
    }
}

/// Sorts a wasmtime error into guest aborts, fuel exhaustion, other traps and host failures.
pub(crate) fn classify(err: anyhow::Error) -> ExecutionError {
    if let Some(abort) = err.downcast_ref::<GuestAbort>() {
        return ExecutionError::Abort(abort.clone());
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => ExecutionError::OutOfFuel,
        Some(trap) => ExecutionError::Trap(trap.to_string()),
        None => ExecutionError::Host(format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_survives_added_context() {
        let abort = GuestAbort {
            message: "boom".into(),
            file: "index.ts".into(),
            line: 3,
            column: 9,
        };
        let err = anyhow::Error::from(abort.clone()).context("while running method");
        assert_eq!(classify(err), ExecutionError::Abort(abort));
    }

    #[test]
    fn traps_are_told_apart() {
        assert_eq!(
            classify(anyhow::Error::from(Trap::OutOfFuel)),
            ExecutionError::OutOfFuel
        );
        assert!(matches!(
            classify(anyhow::Error::from(Trap::UnreachableCodeReached)),
            ExecutionError::Trap(_)
        ));
        assert!(matches!(
            classify(anyhow::anyhow!("disk on fire")),
            ExecutionError::Host(msg) if msg == "disk on fire"
        ));
    }
}
