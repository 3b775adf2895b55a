//! Per-block, per-receiver settlement of a distributed upload.

use crate::config::SettlementConfig;
use crate::error::{VaultError, VaultResult};
use crate::ledger::{bounded, Ledger};
use crate::store::{TrackingStore, UploadPatch};
use futures::stream::{self, StreamExt, TryStreamExt};
use hostvault_protocol::{Assignment, BlockAddress, Identity, UploadRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One payment the ledger should carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub receiver: Identity,
    pub address: BlockAddress,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentPlan {
    pub payments: Vec<Payment>,
    pub total: u128,
}

impl PaymentPlan {
    /// Prices every (resource, receiver) pair at `unit_value * resource_size`.
    ///
    /// A whole-file assignment has one resource, the artifact address, so
    /// each receiver gets `unit_value * size`. Per-block assignments pay
    /// every block to its own receiver subset.
    pub fn for_upload(record: &UploadRecord) -> VaultResult<Self> {
        let assignment = record
            .receivers
            .as_ref()
            .ok_or_else(|| VaultError::NotAssigned(record.file_name.clone()))?;
        let overflow = || VaultError::AmountOverflow(record.file_name.clone());
        let price = |size: u64| record.unit_value.checked_mul(u128::from(size)).ok_or_else(overflow);

        let mut payments = Vec::new();
        match assignment {
            Assignment::FlatToFile(receivers) => {
                let amount = price(record.size)?;
                for receiver in receivers {
                    payments.push(Payment {
                        receiver: receiver.clone(),
                        address: record.file_address.clone(),
                        amount,
                    });
                }
            }
            Assignment::PerBlock(by_block) => {
                if by_block.len() != record.blocks.len() {
                    return Err(VaultError::Corrupt(format!(
                        "{}: {} receiver sets for {} blocks",
                        record.file_name,
                        by_block.len(),
                        record.blocks.len()
                    )));
                }
                for ((address, size), receivers) in
                    record.blocks.iter().zip(&record.block_sizes).zip(by_block)
                {
                    let amount = price(*size)?;
                    for receiver in receivers {
                        payments.push(Payment {
                            receiver: receiver.clone(),
                            address: address.clone(),
                            amount,
                        });
                    }
                }
            }
        }

        let total = payments
            .iter()
            .try_fold(0u128, |acc, p| acc.checked_add(p.amount))
            .ok_or_else(overflow)?;
        Ok(Self { payments, total })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReport {
    pub payments: usize,
    pub total: u128,
    pub last_paid_ms: Option<u64>,
}

pub struct Settler {
    ledger: Arc<dyn Ledger>,
    store: Arc<TrackingStore>,
    call_timeout: Duration,
    config: SettlementConfig,
}

impl Settler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<TrackingStore>,
        call_timeout: Duration,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            call_timeout,
            config,
        }
    }

    /// Pays every receiver of `file_name` for every block it holds.
    ///
    /// Funds are checked before the first payment. A failed payment stops the
    /// rest; payments already confirmed stay paid and a later call pays again.
    /// Cancellation is checked between payments and leaves `last_paid_ms`
    /// untouched.
    pub async fn pay(&self, file_name: &str, cancel: &CancellationToken) -> VaultResult<SettlementReport> {
        let record = self
            .store
            .find_upload(file_name)?
            .ok_or_else(|| VaultError::UnknownUpload(file_name.to_string()))?;
        let plan = PaymentPlan::for_upload(&record)?;

        let payer = self.ledger.account().clone();
        let available = bounded(self.call_timeout, self.ledger.balance(&payer)).await?;
        if available < plan.total {
            warn!(
                file = %file_name,
                required = %plan.total,
                available = %available,
                "Insufficient funds for settlement"
            );
            return Err(VaultError::InsufficientFunds {
                required: plan.total,
                available,
            });
        }

        if self.config.concurrent_payments {
            let limit = self.config.payment_concurrency.max(1);
            stream::iter(plan.payments.iter().map(Ok::<_, VaultError>))
                .try_for_each_concurrent(limit, |payment| async move {
                    if cancel.is_cancelled() {
                        return Err(VaultError::Cancelled);
                    }
                    self.send(payment).await
                })
                .await?;
            // Payments already in flight when the token fired still complete.
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
        } else {
            for payment in &plan.payments {
                if cancel.is_cancelled() {
                    return Err(VaultError::Cancelled);
                }
                self.send(payment).await?;
            }
        }

        let (resource, _) = record
            .resources()
            .into_iter()
            .next()
            .ok_or_else(|| VaultError::Corrupt(format!("{file_name}: no blocks")))?;
        let last_paid_ms =
            bounded(self.call_timeout, self.ledger.last_paid(&resource.split())).await?;
        if let Some(ts) = last_paid_ms {
            let patch = UploadPatch {
                last_paid_ms: Some(ts),
                ..UploadPatch::default()
            };
            self.store.update_upload(file_name, &patch)?;
        }

        info!(
            file = %file_name,
            payments = plan.payments.len(),
            total = %plan.total,
            "Settlement complete"
        );
        Ok(SettlementReport {
            payments: plan.payments.len(),
            total: plan.total,
            last_paid_ms,
        })
    }

    async fn send(&self, payment: &Payment) -> VaultResult<()> {
        let receipt = bounded(
            self.call_timeout,
            self.ledger
                .pay(&payment.receiver, &payment.address.split(), payment.amount),
        )
        .await?;
        info!(
            receiver = %payment.receiver,
            address = %payment.address,
            amount = %payment.amount,
            tx = %receipt.tx_hash,
            "Payment confirmed"
        );
        Ok(())
    }
}
