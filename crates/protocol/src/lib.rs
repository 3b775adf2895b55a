use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ADDRESS_LEN: usize = 46;
pub const ADDRESS_HALF_LEN: usize = ADDRESS_LEN / 2;

pub const EVENT_PAID: &str = "Paid";
pub const EVENT_ASSIGNED: &str = "Assigned";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("block address must be {ADDRESS_LEN} characters, got {0}")]
    Length(usize),
    #[error("block address half must be {ADDRESS_HALF_LEN} characters, got {0}")]
    HalfLength(usize),
    #[error("block address must be ascii")]
    NotAscii,
}

/// Content hash of one encrypted block, as produced by the transfer network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockAddress(String);

/// The two fixed-width halves a [`BlockAddress`] is stored as on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressHalves {
    pub first: String,
    pub second: String,
}

impl BlockAddress {
    pub fn parse(raw: impl Into<String>) -> Result<Self, AddressError> {
        let raw = raw.into();
        if !raw.is_ascii() {
            return Err(AddressError::NotAscii);
        }
        if raw.len() != ADDRESS_LEN {
            return Err(AddressError::Length(raw.len()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn split(&self) -> AddressHalves {
        let (first, second) = self.0.split_at(ADDRESS_HALF_LEN);
        AddressHalves {
            first: first.to_string(),
            second: second.to_string(),
        }
    }
}

impl AddressHalves {
    pub fn join(&self) -> Result<BlockAddress, AddressError> {
        for half in [&self.first, &self.second] {
            if half.len() != ADDRESS_HALF_LEN {
                return Err(AddressError::HalfLength(half.len()));
            }
        }
        BlockAddress::parse(format!("{}{}", self.first, self.second))
    }
}

impl TryFrom<String> for BlockAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BlockAddress> for String {
    fn from(value: BlockAddress) -> Self {
        value.0
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A ledger account, sender or receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which receivers hold a file: the whole file per receiver, or a receiver
/// subset per block (indexed like `UploadRecord::blocks`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment {
    FlatToFile(Vec<Identity>),
    PerBlock(Vec<Vec<Identity>>),
}

impl Assignment {
    /// Every distinct receiver, in first-seen order.
    pub fn receivers(&self) -> Vec<Identity> {
        let mut out: Vec<Identity> = Vec::new();
        let all: Box<dyn Iterator<Item = &Identity>> = match self {
            Assignment::FlatToFile(receivers) => Box::new(receivers.iter()),
            Assignment::PerBlock(by_block) => Box::new(by_block.iter().flatten()),
        };
        for receiver in all {
            if !out.contains(receiver) {
                out.push(receiver.clone());
            }
        }
        out
    }

    pub fn receivers_for_block(&self, index: usize) -> &[Identity] {
        match self {
            Assignment::FlatToFile(receivers) => receivers,
            Assignment::PerBlock(by_block) => by_block.get(index).map(Vec::as_slice).unwrap_or(&[]),
        }
    }
}

/// Sender-side record of one logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub identity: Identity,
    pub file_name: String,
    pub path: String,
    pub size: u64,
    pub unit_value: u128,
    /// Content address of the whole encrypted artifact.
    pub file_address: BlockAddress,
    pub blocks: Vec<BlockAddress>,
    pub block_sizes: Vec<u64>,
    pub receivers: Option<Assignment>,
    pub last_paid_ms: Option<u64>,
    pub mounted: bool,
    pub uploaded: bool,
}

impl UploadRecord {
    /// A freshly encrypted and chunked file that the ledger does not know yet.
    pub fn mounted(
        identity: Identity,
        file_name: impl Into<String>,
        path: impl Into<String>,
        unit_value: u128,
        file_address: BlockAddress,
        blocks: Vec<(BlockAddress, u64)>,
    ) -> Self {
        let size = blocks.iter().map(|(_, len)| *len).sum();
        let (blocks, block_sizes) = blocks.into_iter().unzip();
        Self {
            identity,
            file_name: file_name.into(),
            path: path.into(),
            size,
            unit_value,
            file_address,
            blocks,
            block_sizes,
            receivers: None,
            last_paid_ms: None,
            mounted: true,
            uploaded: false,
        }
    }

    /// First block address; unique per identity.
    pub fn root_address(&self) -> Option<&BlockAddress> {
        self.blocks.first()
    }

    /// Ledger resources this upload's receivers hold, each with its size.
    /// A whole-file assignment is one resource; otherwise every block is.
    pub fn resources(&self) -> Vec<(&BlockAddress, u64)> {
        match &self.receivers {
            Some(Assignment::FlatToFile(_)) => vec![(&self.file_address, self.size)],
            _ => self.blocks.iter().zip(self.block_sizes.iter().copied()).collect(),
        }
    }
}

/// Receiver-side record of one block this identity was asked to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub identity: Identity,
    pub address: BlockAddress,
    pub sender: Identity,
    pub size: u64,
    pub unit_value: u128,
    pub first_seen_ms: u64,
    pub hosted: bool,
    pub path: Option<String>,
    pub hosted_at_ms: Option<u64>,
    pub times_paid: u64,
    pub amount_paid: u128,
}

impl HostRecord {
    pub fn discovered(identity: Identity, block: &AssignedBlock, now_ms: u64) -> Self {
        Self {
            identity,
            address: block.address.clone(),
            sender: block.sender.clone(),
            size: block.size,
            unit_value: block.unit_value,
            first_seen_ms: now_ms,
            hosted: false,
            path: None,
            hosted_at_ms: None,
            times_paid: block.times_paid,
            amount_paid: block.amount_paid,
        }
    }
}

// ── Ledger wire types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub success: bool,
}

/// One row of the ledger's bulk read-back for a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedBlock {
    pub address: BlockAddress,
    pub sender: Identity,
    pub size: u64,
    pub unit_value: u128,
    pub times_paid: u64,
    pub amount_paid: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub name: String,
    pub block_number: u64,
    pub fields: BTreeMap<String, String>,
}

impl LedgerEvent {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

// ── JSON-RPC envelopes ──────────────────────────────────────────

pub mod rpc {
    use serde::{Deserialize, Serialize};

    pub const ASSIGN: &str = "hv_assign";
    pub const PAY: &str = "hv_pay";
    pub const GET_RECEIPT: &str = "hv_getReceipt";
    pub const GET_RECEIVERS: &str = "hv_getReceivers";
    pub const GET_BALANCE: &str = "hv_getBalance";
    pub const GET_LAST_PAID: &str = "hv_getLastPaid";
    pub const GET_ASSIGNED_BLOCKS: &str = "hv_getAssignedBlocks";
    pub const GET_EVENTS: &str = "hv_getEvents";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Request {
        pub jsonrpc: String,
        pub id: u64,
        pub method: String,
        pub params: serde_json::Value,
    }

    impl Request {
        pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
            Self {
                jsonrpc: "2.0".to_string(),
                id,
                method: method.to_string(),
                params,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ErrorBody {
        pub code: i64,
        pub message: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Response {
        pub id: u64,
        #[serde(default)]
        pub result: Option<serde_json::Value>,
        #[serde(default)]
        pub error: Option<ErrorBody>,
    }
}
