use crate::config::LedgerConfig;
use crate::error::LedgerError;
use async_trait::async_trait;
use hostvault_protocol::{
    rpc, AddressHalves, AssignedBlock, BlockAddress, Identity, LedgerEvent, TxReceipt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

pub type LedgerResult<T> = Result<T, LedgerError>;

/// The authoritative ledger. Write calls resolve only once the transaction
/// is confirmed.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Account this handle signs for.
    fn account(&self) -> &Identity;

    /// Binds `address` to the next receiver under the ledger's round-robin
    /// pointer.
    async fn assign(&self, address: &AddressHalves, size: u64, unit_value: u128)
        -> LedgerResult<TxReceipt>;

    async fn receivers(&self, address: &AddressHalves) -> LedgerResult<Vec<Identity>>;

    async fn balance(&self, account: &Identity) -> LedgerResult<u128>;

    async fn pay(
        &self,
        receiver: &Identity,
        address: &AddressHalves,
        amount: u128,
    ) -> LedgerResult<TxReceipt>;

    async fn last_paid(&self, address: &AddressHalves) -> LedgerResult<Option<u64>>;

    /// Bulk read-back of every block assigned to `receiver`.
    async fn assigned_blocks(&self, receiver: &Identity) -> LedgerResult<Vec<AssignedBlock>>;

    async fn events(&self, name: &str, filter: &[(&str, &str)]) -> LedgerResult<Vec<LedgerEvent>>;
}

/// Runs one ledger call under a bounded wait. A timeout is a failure, never
/// retried here.
pub async fn bounded<T, F>(limit: Duration, call: F) -> LedgerResult<T>
where
    F: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit)),
    }
}

/// JSON-RPC 2.0 client for a ledger gateway.
pub struct RpcLedger {
    client: reqwest::Client,
    url: String,
    account: Identity,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(cfg: &LedgerConfig, account: Identity) -> LedgerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.call_timeout())
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: cfg.rpc_url.clone(),
            account,
            confirmation_timeout: cfg.call_timeout(),
            poll_interval: cfg.confirmation_poll(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> LedgerResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = rpc::Request::new(id, method, params);
        let response: rpc::Response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        if let Some(err) = response.error {
            return Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result).map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }

    /// Submits a write and polls until its receipt shows up.
    async fn submit(&self, method: &str, params: serde_json::Value) -> LedgerResult<TxReceipt> {
        let tx_hash: String = self.call(method, params).await?;
        debug!(method, tx = %tx_hash, "Ledger transaction submitted");

        let receipt = bounded(self.confirmation_timeout, self.await_receipt(&tx_hash)).await?;
        info!(method, tx = %receipt.tx_hash, block = receipt.block_number, "Ledger transaction confirmed");
        Ok(receipt)
    }

    async fn await_receipt(&self, tx_hash: &str) -> LedgerResult<TxReceipt> {
        loop {
            let receipt: Option<TxReceipt> = self.call(rpc::GET_RECEIPT, json!([tx_hash])).await?;
            match receipt {
                Some(receipt) if receipt.success => return Ok(receipt),
                Some(receipt) => {
                    return Err(LedgerError::Rejected {
                        tx_hash: receipt.tx_hash,
                    })
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    fn account(&self) -> &Identity {
        &self.account
    }

    async fn assign(
        &self,
        address: &AddressHalves,
        size: u64,
        unit_value: u128,
    ) -> LedgerResult<TxReceipt> {
        self.submit(
            rpc::ASSIGN,
            json!([
                self.account,
                address.first,
                address.second,
                size,
                unit_value.to_string()
            ]),
        )
        .await
    }

    async fn receivers(&self, address: &AddressHalves) -> LedgerResult<Vec<Identity>> {
        self.call(
            rpc::GET_RECEIVERS,
            json!([self.account, address.first, address.second]),
        )
        .await
    }

    async fn balance(&self, account: &Identity) -> LedgerResult<u128> {
        let raw: String = self.call(rpc::GET_BALANCE, json!([account])).await?;
        parse_amount(&raw)
    }

    async fn pay(
        &self,
        receiver: &Identity,
        address: &AddressHalves,
        amount: u128,
    ) -> LedgerResult<TxReceipt> {
        self.submit(
            rpc::PAY,
            json!([
                self.account,
                receiver,
                address.first,
                address.second,
                amount.to_string()
            ]),
        )
        .await
    }

    async fn last_paid(&self, address: &AddressHalves) -> LedgerResult<Option<u64>> {
        self.call(
            rpc::GET_LAST_PAID,
            json!([self.account, address.first, address.second]),
        )
        .await
    }

    async fn assigned_blocks(&self, receiver: &Identity) -> LedgerResult<Vec<AssignedBlock>> {
        self.call(rpc::GET_ASSIGNED_BLOCKS, json!([receiver])).await
    }

    async fn events(&self, name: &str, filter: &[(&str, &str)]) -> LedgerResult<Vec<LedgerEvent>> {
        let filter: serde_json::Map<String, serde_json::Value> = filter
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        self.call(rpc::GET_EVENTS, json!([name, filter])).await
    }
}

pub fn parse_amount(raw: &str) -> LedgerResult<u128> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16),
        None => trimmed.parse::<u128>(),
    };
    parsed.map_err(|e| LedgerError::Decode(format!("invalid amount {raw:?}: {e}")))
}

/// Block address carried by an event as its `address1`/`address2` halves.
pub fn event_address(event: &LedgerEvent) -> Option<BlockAddress> {
    let first = event.field("address1")?;
    let second = event.field("address2")?;
    AddressHalves {
        first: first.to_string(),
        second: second.to_string(),
    }
    .join()
    .ok()
}
