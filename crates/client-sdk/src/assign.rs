//! Replica assignment against the ledger's round-robin pointer.
//!
//! Every assignment call advances shared ledger state, so calls are issued
//! one at a time and each must confirm before the next goes out. Nothing is
//! written to the upload record until all calls succeeded and the receiver
//! set was read back.

use crate::error::{VaultError, VaultResult};
use crate::ledger::{bounded, Ledger};
use crate::store::{TrackingStore, UploadPatch};
use hostvault_protocol::{Assignment, BlockAddress, Identity, UploadRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// The encrypted artifact is one ledger resource under its own address.
    WholeFile,
    /// Every block is assigned on its own.
    PerBlock,
}

#[derive(Debug, Clone, Copy)]
pub struct Distribution {
    pub replicas: usize,
    pub granularity: Granularity,
}

impl Distribution {
    pub fn whole_file(replicas: usize) -> Self {
        Self {
            replicas,
            granularity: Granularity::WholeFile,
        }
    }

    pub fn per_block(replicas: usize) -> Self {
        Self {
            replicas,
            granularity: Granularity::PerBlock,
        }
    }
}

pub struct Distributor {
    ledger: Arc<dyn Ledger>,
    store: Arc<TrackingStore>,
    call_timeout: Duration,
}

impl Distributor {
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<TrackingStore>, call_timeout: Duration) -> Self {
        Self {
            ledger,
            store,
            call_timeout,
        }
    }

    /// Assigns a mounted upload and marks it uploaded.
    ///
    /// Returns the receiver assignment as read back from the ledger.
    pub async fn distribute(
        &self,
        file_name: &str,
        request: Distribution,
        cancel: &CancellationToken,
    ) -> VaultResult<Assignment> {
        if request.replicas == 0 {
            return Err(VaultError::ReplicaCount);
        }
        let record = self
            .store
            .find_upload(file_name)?
            .ok_or_else(|| VaultError::UnknownUpload(file_name.to_string()))?;
        if !record.mounted || record.uploaded {
            return Err(VaultError::NotMounted(file_name.to_string()));
        }

        let assignment = match request.granularity {
            Granularity::WholeFile => {
                let receivers = self
                    .assign_resource(
                        &record.file_address,
                        record.size,
                        &record,
                        request.replicas,
                        cancel,
                    )
                    .await?;
                Assignment::FlatToFile(receivers)
            }
            Granularity::PerBlock => {
                let mut by_block = Vec::with_capacity(record.blocks.len());
                for (address, size) in record.blocks.iter().zip(&record.block_sizes) {
                    let receivers = self
                        .assign_resource(address, *size, &record, request.replicas, cancel)
                        .await?;
                    by_block.push(receivers);
                }
                Assignment::PerBlock(by_block)
            }
        };

        let patch = UploadPatch {
            receivers: Some(assignment.clone()),
            uploaded: Some(true),
            mounted: Some(false),
            ..UploadPatch::default()
        };
        self.store
            .update_upload(file_name, &patch)?
            .ok_or_else(|| VaultError::UnknownUpload(file_name.to_string()))?;

        info!(
            file = %file_name,
            replicas = request.replicas,
            receivers = assignment.receivers().len(),
            "Upload distributed"
        );
        Ok(assignment)
    }

    /// Issues `replicas` confirmed assignment calls for one resource, then
    /// reads back who holds it.
    async fn assign_resource(
        &self,
        address: &BlockAddress,
        size: u64,
        record: &UploadRecord,
        replicas: usize,
        cancel: &CancellationToken,
    ) -> VaultResult<Vec<Identity>> {
        let halves = address.split();
        for attempt in 1..=replicas {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            let receipt = bounded(
                self.call_timeout,
                self.ledger.assign(&halves, size, record.unit_value),
            )
            .await?;
            info!(
                address = %address,
                attempt,
                replicas,
                tx = %receipt.tx_hash,
                "Assignment confirmed"
            );
        }

        let receivers = bounded(self.call_timeout, self.ledger.receivers(&halves)).await?;
        debug!(address = %address, receivers = receivers.len(), "Read back receivers");
        Ok(receivers)
    }
}
