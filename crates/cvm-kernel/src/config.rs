use cvm_wasm::HostCosts;
use serde::{Deserialize, Serialize};

/// Policy knobs for [`crate::TxRunner`]. Missing fields take their defaults, so a host can
/// load a partial JSON or TOML document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Gas charged per byte of deployed code.
    pub deploy_gas_per_byte: u64,
    /// Reject deploys the checker flags. Turning this off is only meant for trusted code:
    /// the byte scan also matches float opcodes inside names and type sections.
    pub enforce_determinism: bool,
    /// Compile-check code with the sandbox's engine before storing it.
    pub validate_on_deploy: bool,
    pub host_costs: HostCosts,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            deploy_gas_per_byte: 0,
            enforce_determinism: true,
            validate_on_deploy: true,
            host_costs: HostCosts::default(),
        }
    }
}
