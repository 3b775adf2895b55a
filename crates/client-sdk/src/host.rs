//! Receiver-side acquisition: discover blocks the ledger assigned to this
//! identity, fetch and pin them, and keep payment counters current.

use crate::config::HostingConfig;
use crate::error::{VaultError, VaultResult};
use crate::ledger::{bounded, event_address, parse_amount, Ledger};
use crate::now_ms;
use crate::store::{HostPatch, InsertOutcome, TrackingStore};
use crate::transfer::TransferNetwork;
use futures::stream::{self, StreamExt};
use hostvault_protocol::{BlockAddress, HostRecord, EVENT_PAID};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts from one acquisition pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub discovered: usize,
    pub already_known: usize,
    pub fetched: usize,
    pub payments_updated: usize,
}

pub struct HostLoop {
    ledger: Arc<dyn Ledger>,
    transfer: Arc<dyn TransferNetwork>,
    store: Arc<TrackingStore>,
    host_dir: PathBuf,
    call_timeout: Duration,
    config: HostingConfig,
}

impl HostLoop {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        transfer: Arc<dyn TransferNetwork>,
        store: Arc<TrackingStore>,
        host_dir: PathBuf,
        call_timeout: Duration,
        config: HostingConfig,
    ) -> Self {
        Self {
            ledger,
            transfer,
            store,
            host_dir,
            call_timeout,
            config,
        }
    }

    /// Records every block assigned to this identity that is not tracked yet.
    /// Returns `(discovered, already_known)`.
    pub async fn refresh_info(&self) -> VaultResult<(usize, usize)> {
        let me = self.store.identity().clone();
        let assigned = bounded(self.call_timeout, self.ledger.assigned_blocks(&me)).await?;
        let now = now_ms();
        let mut discovered = 0;
        let mut known = 0;
        for block in &assigned {
            let record = HostRecord::discovered(me.clone(), block, now);
            match self.store.insert_host(&record)? {
                InsertOutcome::Inserted => {
                    discovered += 1;
                    info!(address = %block.address, sender = %block.sender, "Discovered assigned block");
                }
                InsertOutcome::AlreadyExists => {
                    known += 1;
                    debug!(address = %block.address, "Assigned block already known");
                }
            }
        }
        Ok((discovered, known))
    }

    /// Fetches every discovered-but-not-hosted block, at most
    /// `fetch_concurrency` at a time. Blocks that fetched stay hosted even
    /// when others fail.
    pub async fn fetch_pending(&self, cancel: &CancellationToken) -> VaultResult<usize> {
        let pending = self.store.find_hosts(Some(false))?;
        if pending.is_empty() {
            return Ok(0);
        }
        tokio::fs::create_dir_all(&self.host_dir).await?;

        let limit = self.config.fetch_concurrency.max(1);
        let results: Vec<(BlockAddress, VaultResult<()>)> = stream::iter(pending)
            .map(|record| async move {
                let address = record.address.clone();
                if cancel.is_cancelled() {
                    return (address, Err(VaultError::Cancelled));
                }
                let outcome = self.acquire(&record).await;
                (address, outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut succeeded = 0;
        let mut failed = Vec::new();
        for (address, outcome) in results {
            match outcome {
                Ok(()) => succeeded += 1,
                Err(VaultError::Cancelled) => {}
                Err(err) => {
                    warn!(address = %address, error = %err, "Block fetch failed");
                    failed.push((address, err.to_string()));
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        if !failed.is_empty() {
            return Err(VaultError::PartialBatch { succeeded, failed });
        }
        Ok(succeeded)
    }

    async fn acquire(&self, record: &HostRecord) -> VaultResult<()> {
        let dest = self.host_dir.join(record.address.as_str());
        let bytes = self.transfer.fetch(&record.address, &dest).await?;
        if let Err(err) = self.transfer.pin(&record.address).await {
            warn!(address = %record.address, error = %err, "Pin failed; block kept as hosted");
        }
        let patch = HostPatch::hosted(dest.to_string_lossy(), now_ms());
        self.store.update_host(&record.address, &patch)?;
        info!(address = %record.address, bytes, "Block hosted");
        Ok(())
    }

    /// Folds `Paid` events for this identity into the host records' counters.
    /// Returns how many records changed.
    pub async fn refresh_payments(&self) -> VaultResult<usize> {
        let me = self.store.identity().clone();
        let events = bounded(
            self.call_timeout,
            self.ledger.events(EVENT_PAID, &[("receiver", me.as_str())]),
        )
        .await?;

        let mut totals: BTreeMap<BlockAddress, (u64, u128)> = BTreeMap::new();
        for event in &events {
            let Some(address) = event_address(event) else {
                debug!(block = event.block_number, "Paid event without a block address");
                continue;
            };
            let amount = match event.field("amount").map(parse_amount) {
                Some(Ok(amount)) => amount,
                Some(Err(err)) => return Err(err.into()),
                None => 0,
            };
            let entry = totals.entry(address).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(amount);
        }

        let mut updated = 0;
        for (address, (times, amount)) in totals {
            let Some(current) = self.store.find_host(&address)? else {
                continue;
            };
            if current.times_paid == times && current.amount_paid == amount {
                continue;
            }
            self.store
                .update_host(&address, &HostPatch::payments(times, amount))?;
            updated += 1;
        }
        Ok(updated)
    }

    /// One full pass: discover, fetch, then refresh payment counters.
    ///
    /// Payment counters are refreshed even when some fetches failed; the
    /// fetch error is returned afterwards.
    pub async fn run_once(&self, cancel: &CancellationToken) -> VaultResult<PassReport> {
        let (discovered, already_known) = self.refresh_info().await?;
        let fetched = match self.fetch_pending(cancel).await {
            Err(VaultError::Cancelled) => return Err(VaultError::Cancelled),
            other => other,
        };
        let payments_updated = self.refresh_payments().await?;
        let fetched = fetched?;
        let report = PassReport {
            discovered,
            already_known,
            fetched,
            payments_updated,
        };
        debug!(?report, "Acquisition pass finished");
        Ok(report)
    }

    /// Repeats [`HostLoop::run_once`] every `refresh_interval_secs` until
    /// cancelled. A failed pass is logged and the next tick retries.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.refresh_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(identity = %self.store.identity(), interval = ?period, "Host loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once(&cancel).await {
                        Ok(report) if report.discovered + report.fetched > 0 => {
                            info!(
                                discovered = report.discovered,
                                fetched = report.fetched,
                                payments_updated = report.payments_updated,
                                "Acquisition pass"
                            );
                        }
                        Ok(_) => {}
                        Err(VaultError::Cancelled) => break,
                        Err(err) => warn!(error = %err, "Acquisition pass failed"),
                    }
                }
            }
        }
        info!("Host loop stopped");
    }

    /// Stops hosting `address`: unpin, delete local bytes, drop the record.
    pub async fn remove(&self, address: &BlockAddress) -> VaultResult<bool> {
        let Some(record) = self.store.find_host(address)? else {
            return Ok(false);
        };
        if let Err(err) = self.transfer.unpin(address).await {
            warn!(address = %address, error = %err, "Unpin failed");
        }
        if let Some(path) = &record.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.store.remove_host(address)?;
        info!(address = %address, "Stopped hosting block");
        Ok(true)
    }
}
