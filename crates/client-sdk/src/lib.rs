pub mod assign;
pub mod chunker;
pub mod config;
pub mod error;
pub mod host;
pub mod ledger;
pub mod pipeline;
pub mod settle;
pub mod store;
pub mod transfer;
pub mod upload;

pub use assign::{Distribution, Distributor, Granularity};
pub use config::{default_config_path, VaultConfig};
pub use error::{LedgerError, StoreError, TransferError, VaultError, VaultResult};
pub use host::{HostLoop, PassReport};
pub use ledger::{bounded, Ledger, RpcLedger};
pub use settle::{PaymentPlan, SettlementReport, Settler};
pub use store::{HostPatch, InsertOutcome, StoreRegistry, TrackingStore, UploadPatch};
pub use transfer::{HttpTransfer, TransferNetwork};
pub use upload::{mount, retrieve, MountOutcome};

pub use hostvault_protocol::{
    AddressHalves, Assignment, BlockAddress, HostRecord, Identity, UploadRecord,
};

pub use tokio_util::sync::CancellationToken;

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Runs blocking file work off the async executor.
pub(crate) async fn blocking<T, F>(work: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
