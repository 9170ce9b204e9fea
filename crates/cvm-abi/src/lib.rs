//! Message, event and transaction envelopes shared by the runner, the sandbox and hosts.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Current version carried in transaction envelopes.
pub const TX_ENVELOPE_VERSION: u8 = 1;

/// Method name the dispatcher treats as the one-shot constructor.
pub const INIT_METHOD: &str = "init";

/// Import namespace for storage, call, create and event host functions.
pub const RUNTIME_NAMESPACE: &str = "runtime";
/// Import namespace for the guest abort hook.
pub const ENV_NAMESPACE: &str = "env";

pub const DB_SAVE: &str = "db.save";
pub const DB_LOAD: &str = "db.load";
pub const CONTRACT_CALL: &str = "contract.call";
pub const CONTRACT_CREATE: &str = "contract.create";
pub const EVENT_EMIT: &str = "event.emit";
pub const ABORT: &str = "abort";

/// Sequential identifier of a deployed code blob.
pub type CodeId = u64;

/// Text-encoded contract address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(String);

impl ContractId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `base58(sha256(state ++ le64(code_id) ++ le64(salt)))`.
    ///
    /// The salt is the store's running total of created contracts, so two creations from the
    /// same state and code still land on different ids.
    pub fn derive(state: &[u8], code_id: CodeId, salt: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(state);
        hasher.update(code_id.to_le_bytes());
        hasher.update(salt.to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        Self(bs58::encode(digest).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContractId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ContractId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Invocation of one exported method on one contract.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContractMessage {
    pub contract: ContractId,
    pub method: String,
    #[serde(with = "serde_bytes")]
    pub args: Vec<u8>,
    pub sender: ContractId,
}

impl ContractMessage {
    pub fn new(
        contract: impl Into<ContractId>,
        method: impl Into<String>,
        args: Vec<u8>,
        sender: impl Into<ContractId>,
    ) -> Self {
        Self {
            contract: contract.into(),
            method: method.into(),
            args,
            sender: sender.into(),
        }
    }

    pub fn is_init(&self) -> bool {
        self.method == INIT_METHOD
    }
}

/// Registers immutable bytecode under a fresh code id.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeployContractCodeMessage {
    #[serde(with = "serde_bytes")]
    pub code: Vec<u8>,
    pub sender: ContractId,
}

/// Instantiates a contract from deployed code and runs its `init` method.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InitializeContractMessage {
    pub code_id: CodeId,
    #[serde(with = "serde_bytes")]
    pub args: Vec<u8>,
    pub sender: ContractId,
}

/// One step of a transaction.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VmMessage {
    Deploy(DeployContractCodeMessage),
    Initialize(InitializeContractMessage),
    Call(ContractMessage),
}

impl VmMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            VmMessage::Deploy(_) => "deploy",
            VmMessage::Initialize(_) => "initialize",
            VmMessage::Call(_) => "call",
        }
    }
}

impl From<DeployContractCodeMessage> for VmMessage {
    fn from(value: DeployContractCodeMessage) -> Self {
        VmMessage::Deploy(value)
    }
}

impl From<InitializeContractMessage> for VmMessage {
    fn from(value: InitializeContractMessage) -> Self {
        VmMessage::Initialize(value)
    }
}

impl From<ContractMessage> for VmMessage {
    fn from(value: ContractMessage) -> Self {
        VmMessage::Call(value)
    }
}

/// Ordered messages sharing one gas ceiling and one opaque global state blob.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Transaction {
    pub version: u8,
    pub gas_limit: u64,
    #[serde(with = "serde_bytes")]
    pub state: Vec<u8>,
    pub messages: Vec<VmMessage>,
}

impl Transaction {
    pub fn new(gas_limit: u64, state: Vec<u8>, messages: Vec<VmMessage>) -> Self {
        Self {
            version: TX_ENVELOPE_VERSION,
            gas_limit,
            state,
            messages,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
        let tx: Transaction = serde_cbor::from_slice(bytes)?;
        if tx.version != TX_ENVELOPE_VERSION {
            return Err(AbiDecodeError::UnsupportedVersion { found: tx.version });
        }
        Ok(tx)
    }

    pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
        serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
    }
}

/// Event emitted by a contract, tagged with its origin.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResultEvent {
    pub contract: ContractId,
    pub name: String,
    pub data: String,
}

impl ResultEvent {
    pub fn new(contract: ContractId, name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            contract,
            name: name.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AbiDecodeError {
    #[error("envelope version {found} is not supported (expected {TX_ENVELOPE_VERSION})")]
    UnsupportedVersion { found: u8 },
    #[error("failed to decode envelope: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

#[derive(Debug, Error)]
pub enum AbiEncodeError {
    #[error("failed to encode envelope: {0}")]
    Cbor(#[from] serde_cbor::Error),
}
