//! Persisted key layout. Every namespace has its own prefix so keys never collide.

use cvm_abi::{CodeId, ContractId};

pub const CONTRACT_CODE_PREFIX: &str = "contracts/codes";
pub const CONTRACT_MODULE_PREFIX: &str = "contracts/modules";
pub const CONTRACT_ENTITY_PREFIX: &str = "contracts/entities";
pub const CONTRACT_INITIALIZED_PREFIX: &str = "contracts/initialized";
pub const NEXT_CODE_ID_KEY: &str = "contracts/next_code_id";
pub const TOTAL_CONTRACTS_KEY: &str = "contracts/total";
pub const VERSION_PREFIX: &str = "version";

pub fn code_key(code_id: CodeId) -> Vec<u8> {
    format!("{CONTRACT_CODE_PREFIX}/{code_id}").into_bytes()
}

/// Pointer from a contract to the code it was created from.
pub fn module_key(contract: &ContractId) -> Vec<u8> {
    format!("{CONTRACT_MODULE_PREFIX}/{contract}").into_bytes()
}

pub fn entity_key(contract: &ContractId, key: &str) -> Vec<u8> {
    format!("{CONTRACT_ENTITY_PREFIX}/{contract}/{key}").into_bytes()
}

pub fn initialized_key(contract: &ContractId) -> Vec<u8> {
    format!("{CONTRACT_INITIALIZED_PREFIX}/{contract}").into_bytes()
}

pub fn version_key(id: u64) -> Vec<u8> {
    format!("{VERSION_PREFIX}/{id}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_distinct() {
        let contract = ContractId::new("abc");
        let keys = [
            code_key(7),
            module_key(&contract),
            entity_key(&contract, "count"),
            initialized_key(&contract),
            NEXT_CODE_ID_KEY.as_bytes().to_vec(),
            TOTAL_CONTRACTS_KEY.as_bytes().to_vec(),
            version_key(7),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert_eq!(entity_key(&contract, "count"), b"contracts/entities/abc/count");
        assert_eq!(initialized_key(&contract), b"contracts/initialized/abc");
    }
}
