#![allow(dead_code)]

use async_trait::async_trait;
use hostvault_protocol::{
    AddressHalves, AssignedBlock, BlockAddress, Identity, LedgerEvent, TxReceipt, EVENT_PAID,
};
use hostvault_sdk::config::StorageConfig;
use hostvault_sdk::ledger::{Ledger, LedgerResult};
use hostvault_sdk::transfer::{TransferNetwork, TransferResult};
use hostvault_sdk::{CancellationToken, LedgerError, TransferError};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// 1/(1024*1024) tokens per byte at 10^18 base units per token.
pub const LEMON_UNIT_VALUE: u128 = 1_000_000_000_000_000_000 / (1024 * 1024);

pub fn storage(root: &Path, block_size: usize) -> StorageConfig {
    StorageConfig {
        store_root: root.join("db"),
        work_dir: root.join("work"),
        host_dir: root.join("hosted"),
        block_size,
    }
}

pub fn address_of(bytes: &[u8]) -> BlockAddress {
    let digest = hex::encode(Sha256::digest(bytes));
    BlockAddress::parse(format!("Qm{}", &digest[..44])).expect("46-char address")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Assign(BlockAddress),
    Receivers(BlockAddress),
    Balance(Identity),
    Pay(Identity, BlockAddress, u128),
    LastPaid(BlockAddress),
    AssignedBlocks(Identity),
    Events(String),
}

#[derive(Default)]
struct LedgerState {
    pointer: usize,
    calls: Vec<Call>,
    receivers: HashMap<BlockAddress, Vec<Identity>>,
    assigned: Vec<(Identity, AssignedBlock)>,
    balances: HashMap<Identity, u128>,
    payments: Vec<(Identity, BlockAddress, u128)>,
    last_paid: HashMap<BlockAddress, u64>,
    fail_assign_at: Option<usize>,
    fail_pay_at: Option<usize>,
    cancel_after_pays: Option<(usize, CancellationToken)>,
    in_flight: usize,
    max_in_flight: usize,
    tx: u64,
}

/// In-memory ledger with a round-robin pointer over a fixed receiver pool.
pub struct MockLedger {
    account: Identity,
    pool: Vec<Identity>,
    delay: Duration,
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new(account: &str, pool: &[&str]) -> Self {
        Self {
            account: Identity::new(account),
            pool: pool.iter().map(|p| Identity::new(*p)).collect(),
            delay: Duration::from_millis(2),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fund(&self, who: &str, amount: u128) {
        self.state()
            .balances
            .insert(Identity::new(who), amount);
    }

    /// The `n`th assignment call (1-based) fails.
    pub fn fail_assign_at(&self, n: usize) {
        self.state().fail_assign_at = Some(n);
    }

    /// The `n`th payment call (1-based) fails.
    pub fn fail_pay_at(&self, n: usize) {
        self.state().fail_pay_at = Some(n);
    }

    /// Cancels `token` once `n` payments have confirmed.
    pub fn cancel_after_pays(&self, n: usize, token: CancellationToken) {
        self.state().cancel_after_pays = Some((n, token));
    }

    /// Records a block as assigned to `receiver` without going through
    /// `assign`, for receiver-side tests.
    pub fn assign_block(&self, receiver: &str, address: &BlockAddress, size: u64, unit_value: u128) {
        let block = AssignedBlock {
            address: address.clone(),
            sender: self.account.clone(),
            size,
            unit_value,
            times_paid: 0,
            amount_paid: 0,
        };
        self.state().assigned.push((Identity::new(receiver), block));
    }

    pub fn record_payment(&self, receiver: &str, address: &BlockAddress, amount: u128) {
        self.state()
            .payments
            .push((Identity::new(receiver), address.clone(), amount));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn payments(&self) -> Vec<(Identity, BlockAddress, u128)> {
        self.state().payments.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn balance_of(&self, who: &str) -> u128 {
        self.state()
            .balances
            .get(&Identity::new(who))
            .copied()
            .unwrap_or(0)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().expect("ledger state")
    }

    fn enter(&self, call: Call) -> usize {
        let mut state = self.state();
        state.calls.push(call);
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        state.calls.len()
    }

    fn leave(&self) {
        self.state().in_flight -= 1;
    }

    fn receipt(state: &mut LedgerState) -> TxReceipt {
        state.tx += 1;
        TxReceipt {
            tx_hash: format!("0x{:064x}", state.tx),
            block_number: state.tx,
            success: true,
        }
    }
}

fn join(halves: &AddressHalves) -> LedgerResult<BlockAddress> {
    halves.join().map_err(|e| LedgerError::Rpc {
        code: -32602,
        message: e.to_string(),
    })
}

#[async_trait]
impl Ledger for MockLedger {
    fn account(&self) -> &Identity {
        &self.account
    }

    async fn assign(
        &self,
        address: &AddressHalves,
        size: u64,
        unit_value: u128,
    ) -> LedgerResult<TxReceipt> {
        let address = join(address)?;
        self.enter(Call::Assign(address.clone()));
        tokio::time::sleep(self.delay).await;

        let mut state = self.state();
        state.in_flight -= 1;
        let attempt = state
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Assign(_)))
            .count();
        if state.fail_assign_at == Some(attempt) {
            return Err(LedgerError::Rejected {
                tx_hash: "0xdead".to_string(),
            });
        }
        let receiver = self.pool[state.pointer % self.pool.len()].clone();
        state.pointer += 1;
        let holders = state.receivers.entry(address.clone()).or_default();
        if !holders.contains(&receiver) {
            holders.push(receiver.clone());
        }
        let block = AssignedBlock {
            address,
            sender: self.account.clone(),
            size,
            unit_value,
            times_paid: 0,
            amount_paid: 0,
        };
        state.assigned.push((receiver, block));
        Ok(Self::receipt(&mut state))
    }

    async fn receivers(&self, address: &AddressHalves) -> LedgerResult<Vec<Identity>> {
        let address = join(address)?;
        self.enter(Call::Receivers(address.clone()));
        self.leave();
        Ok(self
            .state()
            .receivers
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn balance(&self, account: &Identity) -> LedgerResult<u128> {
        self.enter(Call::Balance(account.clone()));
        self.leave();
        Ok(self.state().balances.get(account).copied().unwrap_or(0))
    }

    async fn pay(
        &self,
        receiver: &Identity,
        address: &AddressHalves,
        amount: u128,
    ) -> LedgerResult<TxReceipt> {
        let address = join(address)?;
        self.enter(Call::Pay(receiver.clone(), address.clone(), amount));
        tokio::time::sleep(self.delay).await;

        let mut state = self.state();
        state.in_flight -= 1;
        let attempt = state
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Pay(..)))
            .count();
        if state.fail_pay_at == Some(attempt) {
            return Err(LedgerError::Timeout(Duration::from_secs(1)));
        }
        let payer = state.balances.entry(self.account.clone()).or_insert(0);
        *payer = payer.saturating_sub(amount);
        *state.balances.entry(receiver.clone()).or_insert(0) += amount;
        state
            .payments
            .push((receiver.clone(), address.clone(), amount));
        let receipt = Self::receipt(&mut state);
        state
            .last_paid
            .insert(address, 1_700_000_000_000 + receipt.block_number);
        if let Some((n, token)) = &state.cancel_after_pays {
            if state.payments.len() >= *n {
                token.cancel();
            }
        }
        Ok(receipt)
    }

    async fn last_paid(&self, address: &AddressHalves) -> LedgerResult<Option<u64>> {
        let address = join(address)?;
        self.enter(Call::LastPaid(address.clone()));
        self.leave();
        Ok(self.state().last_paid.get(&address).copied())
    }

    async fn assigned_blocks(&self, receiver: &Identity) -> LedgerResult<Vec<AssignedBlock>> {
        self.enter(Call::AssignedBlocks(receiver.clone()));
        self.leave();
        Ok(self
            .state()
            .assigned
            .iter()
            .filter(|(who, _)| who == receiver)
            .map(|(_, block)| block.clone())
            .collect())
    }

    async fn events(&self, name: &str, filter: &[(&str, &str)]) -> LedgerResult<Vec<LedgerEvent>> {
        self.enter(Call::Events(name.to_string()));
        self.leave();
        if name != EVENT_PAID {
            return Ok(Vec::new());
        }
        let state = self.state();
        let events = state
            .payments
            .iter()
            .enumerate()
            .map(|(i, (receiver, address, amount))| {
                let halves = address.split();
                let fields: BTreeMap<String, String> = [
                    ("receiver", receiver.to_string()),
                    ("address1", halves.first),
                    ("address2", halves.second),
                    ("amount", amount.to_string()),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
                LedgerEvent {
                    name: EVENT_PAID.to_string(),
                    block_number: i as u64 + 1,
                    fields,
                }
            })
            .filter(|event| filter.iter().all(|(k, v)| event.field(k) == Some(*v)))
            .collect();
        Ok(events)
    }
}

/// In-memory content-addressed store.
#[derive(Default)]
pub struct MockTransfer {
    blobs: Mutex<HashMap<BlockAddress, Vec<u8>>>,
    pinned: Mutex<HashSet<BlockAddress>>,
    missing: Mutex<HashSet<BlockAddress>>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetch_delay: Duration,
    fixed_address: Mutex<Option<BlockAddress>>,
    fail_pins: AtomicBool,
}

impl MockTransfer {
    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: delay,
            ..Self::default()
        }
    }

    /// Every later `add` or `put` yields `address`, whatever the content.
    pub fn fix_address(&self, address: BlockAddress) {
        *self.fixed_address.lock().expect("fixed address") = Some(address);
    }

    pub fn put(&self, bytes: &[u8]) -> BlockAddress {
        let fixed = self.fixed_address.lock().expect("fixed address").clone();
        let address = fixed.unwrap_or_else(|| address_of(bytes));
        self.blobs
            .lock()
            .expect("blobs")
            .insert(address.clone(), bytes.to_vec());
        address
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total bytes stored under `address`.
    pub fn len_of(&self, address: &BlockAddress) -> Option<usize> {
        self.blobs.lock().expect("blobs").get(address).map(Vec::len)
    }

    pub fn fail_pins(&self, fail: bool) {
        self.fail_pins.store(fail, Ordering::SeqCst);
    }

    /// Makes `address` unfetchable until cleared.
    pub fn hide(&self, address: &BlockAddress) {
        self.missing.lock().expect("missing").insert(address.clone());
    }

    pub fn unhide(&self, address: &BlockAddress) {
        self.missing.lock().expect("missing").remove(address);
    }

    pub fn is_pinned(&self, address: &BlockAddress) -> bool {
        self.pinned.lock().expect("pinned").contains(address)
    }
}

#[async_trait]
impl TransferNetwork for MockTransfer {
    async fn add(&self, path: &Path) -> TransferResult<BlockAddress> {
        let bytes = tokio::fs::read(path).await?;
        Ok(self.put(&bytes))
    }

    async fn fetch(&self, address: &BlockAddress, dest: &Path) -> TransferResult<u64> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.fetch_delay).await;
        let result = self.copy_out(address, dest).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn pin(&self, address: &BlockAddress) -> TransferResult<()> {
        if self.fail_pins.load(Ordering::SeqCst) {
            return Err(TransferError::Http("pin refused".to_string()));
        }
        self.pinned.lock().expect("pinned").insert(address.clone());
        Ok(())
    }

    async fn unpin(&self, address: &BlockAddress) -> TransferResult<()> {
        self.pinned.lock().expect("pinned").remove(address);
        Ok(())
    }
}

impl MockTransfer {
    async fn copy_out(&self, address: &BlockAddress, dest: &Path) -> TransferResult<u64> {
        if self.missing.lock().expect("missing").contains(address) {
            return Err(TransferError::Http(format!("{address}: not found")));
        }
        let bytes = self
            .blobs
            .lock()
            .expect("blobs")
            .get(address)
            .cloned()
            .ok_or_else(|| TransferError::Http(format!("{address}: not found")))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}
