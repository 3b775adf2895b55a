//! Per-identity tracking store.
//!
//! One sled database per identity under the registry root. Trees:
//! - `uploads`:         file name            -> UploadRecord
//! - `uploads_by_root`: first block address  -> file name (unique index)
//! - `hosts`:           block address        -> HostRecord

use crate::error::StoreError;
use hostvault_protocol::{Assignment, BlockAddress, HostRecord, Identity, UploadRecord};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub type StoreResult<T> = Result<T, StoreError>;

const UPLOADS_TREE: &str = "uploads";
const UPLOADS_BY_ROOT_TREE: &str = "uploads_by_root";
const HOSTS_TREE: &str = "hosts";

/// Result of an idempotent insert. A duplicate key is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Field-level changes to an [`UploadRecord`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct UploadPatch {
    pub receivers: Option<Assignment>,
    pub mounted: Option<bool>,
    pub uploaded: Option<bool>,
    pub last_paid_ms: Option<u64>,
}

/// Field-level changes to a [`HostRecord`].
#[derive(Debug, Clone, Default)]
pub struct HostPatch {
    hosted: Option<(String, u64)>,
    times_paid: Option<u64>,
    amount_paid: Option<u128>,
}

impl UploadPatch {
    fn apply(&self, record: &mut UploadRecord) {
        if let Some(receivers) = &self.receivers {
            record.receivers = Some(receivers.clone());
        }
        if let Some(mounted) = self.mounted {
            record.mounted = mounted;
        }
        if let Some(uploaded) = self.uploaded {
            record.uploaded = uploaded;
        }
        if let Some(ts) = self.last_paid_ms {
            record.last_paid_ms = Some(ts);
        }
    }
}

impl HostPatch {
    /// Marks a block hosted; path and timestamp always travel together.
    pub fn hosted(path: impl Into<String>, at_ms: u64) -> Self {
        Self {
            hosted: Some((path.into(), at_ms)),
            ..Self::default()
        }
    }

    pub fn payments(times_paid: u64, amount_paid: u128) -> Self {
        Self {
            times_paid: Some(times_paid),
            amount_paid: Some(amount_paid),
            ..Self::default()
        }
    }

    fn apply(&self, record: &mut HostRecord) {
        if let Some((path, at_ms)) = &self.hosted {
            record.hosted = true;
            record.path = Some(path.clone());
            record.hosted_at_ms = Some(*at_ms);
        }
        if let Some(times) = self.times_paid {
            record.times_paid = times;
        }
        if let Some(amount) = self.amount_paid {
            record.amount_paid = amount;
        }
    }
}

pub struct TrackingStore {
    identity: Identity,
    db: Db,
    uploads: Tree,
    uploads_by_root: Tree,
    hosts: Tree,
}

impl TrackingStore {
    pub fn open(path: &Path, identity: Identity) -> StoreResult<Self> {
        let db = sled::open(path)?;
        let uploads = db.open_tree(UPLOADS_TREE)?;
        let uploads_by_root = db.open_tree(UPLOADS_BY_ROOT_TREE)?;
        let hosts = db.open_tree(HOSTS_TREE)?;
        debug!(identity = %identity, path = %path.display(), "Opened tracking store");
        Ok(Self {
            identity,
            db,
            uploads,
            uploads_by_root,
            hosts,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    // ── uploads ─────────────────────────────────────────────────

    /// Inserts unless the file name or the first block address is already
    /// tracked for this identity.
    pub fn insert_upload(&self, record: &UploadRecord) -> StoreResult<InsertOutcome> {
        self.check_owner(&record.identity)?;
        if record.blocks.len() != record.block_sizes.len() {
            return Err(StoreError::Invalid(format!(
                "{}: {} blocks but {} block sizes",
                record.file_name,
                record.blocks.len(),
                record.block_sizes.len()
            )));
        }
        let Some(root) = record.root_address() else {
            return Err(StoreError::Invalid(format!("{}: no blocks", record.file_name)));
        };
        if record.receivers.is_some() && !record.uploaded {
            return Err(StoreError::Invalid(format!(
                "{}: receivers set before upload completed",
                record.file_name
            )));
        }

        let name_key = record.file_name.as_bytes();
        let root_key = root.as_str().as_bytes();
        let value = encode(record)?;

        let result = (&self.uploads, &self.uploads_by_root).transaction(
            |(uploads, by_root)| -> Result<InsertOutcome, ConflictableTransactionError<StoreError>> {
            if uploads.get(name_key)?.is_some() || by_root.get(root_key)?.is_some() {
                return Ok(InsertOutcome::AlreadyExists);
            }
            uploads.insert(name_key, value.as_slice())?;
            by_root.insert(root_key, name_key)?;
            Ok(InsertOutcome::Inserted)
        });
        let outcome = unwrap_tx(result)?;
        if outcome == InsertOutcome::AlreadyExists {
            debug!(file = %record.file_name, "Upload already tracked");
        }
        Ok(outcome)
    }

    pub fn find_upload(&self, file_name: &str) -> StoreResult<Option<UploadRecord>> {
        self.uploads
            .get(file_name.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    pub fn find_upload_by_root(&self, root: &BlockAddress) -> StoreResult<Option<UploadRecord>> {
        match self.uploads_by_root.get(root.as_str().as_bytes())? {
            Some(name) => self
                .uploads
                .get(name)?
                .map(|raw| decode(&raw))
                .transpose(),
            None => Ok(None),
        }
    }

    pub fn find_uploads<F>(&self, predicate: F) -> StoreResult<Vec<UploadRecord>>
    where
        F: Fn(&UploadRecord) -> bool,
    {
        scan(&self.uploads, predicate)
    }

    /// Merges `patch` into the stored record; `None` if it is not tracked.
    pub fn update_upload(
        &self,
        file_name: &str,
        patch: &UploadPatch,
    ) -> StoreResult<Option<UploadRecord>> {
        update(&self.uploads, file_name.as_bytes(), |record: &mut UploadRecord| {
            patch.apply(record)
        })
    }

    pub fn remove_upload(&self, file_name: &str) -> StoreResult<bool> {
        let Some(record) = self.find_upload(file_name)? else {
            return Ok(false);
        };
        self.uploads.remove(file_name.as_bytes())?;
        if let Some(root) = record.root_address() {
            self.uploads_by_root.remove(root.as_str().as_bytes())?;
        }
        Ok(true)
    }

    // ── hosts ───────────────────────────────────────────────────

    /// Inserts unless a record for the block address already exists.
    pub fn insert_host(&self, record: &HostRecord) -> StoreResult<InsertOutcome> {
        self.check_owner(&record.identity)?;
        if record.hosted && (record.path.is_none() || record.hosted_at_ms.is_none()) {
            return Err(StoreError::Invalid(format!(
                "{}: hosted without path or timestamp",
                record.address
            )));
        }
        let value = encode(record)?;
        let swapped = self.hosts.compare_and_swap(
            record.address.as_str().as_bytes(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        match swapped {
            Ok(()) => Ok(InsertOutcome::Inserted),
            Err(_) => Ok(InsertOutcome::AlreadyExists),
        }
    }

    pub fn find_host(&self, address: &BlockAddress) -> StoreResult<Option<HostRecord>> {
        self.hosts
            .get(address.as_str().as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// All host records, or only those whose `hosted` flag matches.
    pub fn find_hosts(&self, hosted: Option<bool>) -> StoreResult<Vec<HostRecord>> {
        scan(&self.hosts, |record: &HostRecord| {
            hosted.map_or(true, |want| record.hosted == want)
        })
    }

    pub fn update_host(
        &self,
        address: &BlockAddress,
        patch: &HostPatch,
    ) -> StoreResult<Option<HostRecord>> {
        update(&self.hosts, address.as_str().as_bytes(), |record: &mut HostRecord| {
            patch.apply(record)
        })
    }

    pub fn remove_host(&self, address: &BlockAddress) -> StoreResult<Option<HostRecord>> {
        self.hosts
            .remove(address.as_str().as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    // ── maintenance ─────────────────────────────────────────────

    /// Drops every record. Development and test use only.
    pub fn reset(&self) -> StoreResult<()> {
        self.uploads.clear()?;
        self.uploads_by_root.clear()?;
        self.hosts.clear()?;
        self.db.flush()?;
        info!(identity = %self.identity, "Tracking store reset");
        Ok(())
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn check_owner(&self, owner: &Identity) -> StoreResult<()> {
        if owner != &self.identity {
            return Err(StoreError::Invalid(format!(
                "record owned by {owner} cannot be stored for {}",
                self.identity
            )));
        }
        Ok(())
    }
}

/// Process-wide map of identity -> store. Two requests for the same
/// identity get the same instance.
pub struct StoreRegistry {
    root: PathBuf,
    stores: Mutex<HashMap<Identity, Arc<TrackingStore>>>,
}

impl StoreRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, identity: &Identity) -> StoreResult<Arc<TrackingStore>> {
        // Held across the open so concurrent first access creates one instance.
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StoreError::Invalid("store registry lock poisoned".to_string()))?;
        if let Some(store) = stores.get(identity) {
            return Ok(Arc::clone(store));
        }
        let path = self.root.join(store_dir_name(identity));
        std::fs::create_dir_all(&self.root).map_err(sled::Error::Io)?;
        let store = Arc::new(TrackingStore::open(&path, identity.clone())?);
        stores.insert(identity.clone(), Arc::clone(&store));
        Ok(store)
    }

    /// Flushes and forgets every open store.
    pub fn close(&self) -> StoreResult<()> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StoreError::Invalid("store registry lock poisoned".to_string()))?;
        for store in stores.values() {
            store.flush()?;
        }
        stores.clear();
        Ok(())
    }
}

/// Hex of the identity bytes, so distinct identities never share a directory.
fn store_dir_name(identity: &Identity) -> String {
    hex::encode(identity.as_str().as_bytes())
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> StoreResult<T> {
    Ok(bincode::deserialize(raw)?)
}

fn scan<T, F>(tree: &Tree, predicate: F) -> StoreResult<Vec<T>>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_, raw) = item?;
        let record: T = decode(&raw)?;
        if predicate(&record) {
            out.push(record);
        }
    }
    Ok(out)
}

/// Read-modify-write with compare-and-swap, retried on concurrent change.
fn update<T, F>(tree: &Tree, key: &[u8], mutate: F) -> StoreResult<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&mut T),
{
    loop {
        let Some(current) = tree.get(key)? else {
            return Ok(None);
        };
        let mut record: T = decode(&current)?;
        mutate(&mut record);
        let next = encode(&record)?;
        if tree
            .compare_and_swap(key, Some(current), Some(next))?
            .is_ok()
        {
            return Ok(Some(record));
        }
    }
}

fn unwrap_tx<T>(result: Result<T, TransactionError<StoreError>>) -> StoreResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(StoreError::Sled(err)),
    }
}
