//! Sender-side entry and exit of a file: mount (encrypt, chunk, track) and
//! retrieve (fetch, reassemble, decrypt).

use crate::blocking;
use crate::chunker::{assemble_blocks, chunk_file};
use crate::config::StorageConfig;
use crate::error::{VaultError, VaultResult};
use crate::pipeline::{decrypt_file, encrypt_file, ENCRYPTED_EXTENSION};
use crate::store::{InsertOutcome, TrackingStore};
use crate::transfer::TransferNetwork;
use hostvault_protocol::UploadRecord;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct MountOutcome {
    pub outcome: InsertOutcome,
    /// The tracked record: the new one, or the one already present.
    pub record: UploadRecord,
}

/// Encrypts `source`, addresses the artifact and its blocks on the transfer
/// network and tracks the result as a mounted upload.
///
/// A file name the identity already tracks is reported as
/// [`InsertOutcome::AlreadyExists`] without touching the network.
pub async fn mount<T>(
    transfer: &T,
    store: &TrackingStore,
    storage: &StorageConfig,
    source: &Path,
    passphrase: &str,
    unit_value: u128,
) -> VaultResult<MountOutcome>
where
    T: TransferNetwork + ?Sized,
{
    let file_name = file_name_of(source)?;
    if let Some(existing) = store.find_upload(&file_name)? {
        info!(file = %file_name, "Upload already tracked; skipping mount");
        return Ok(MountOutcome {
            outcome: InsertOutcome::AlreadyExists,
            record: existing,
        });
    }

    let src = source.to_path_buf();
    let out_dir = storage.work_dir.join("encrypted");
    let pass = passphrase.to_string();
    let encrypted = blocking(move || encrypt_file(&src, &out_dir, &pass)).await?;
    let file_address = transfer.add(&encrypted).await?;

    let blocks_dir = storage.work_dir.join("blocks").join(&file_name);
    let blocks = chunk_file(transfer, &encrypted, &blocks_dir, storage.block_size).await?;
    if let Err(err) = tokio::fs::remove_dir_all(&blocks_dir).await {
        warn!(dir = %blocks_dir.display(), error = %err, "Could not clean split blocks");
    }

    let record = UploadRecord::mounted(
        store.identity().clone(),
        file_name.clone(),
        source.to_string_lossy(),
        unit_value,
        file_address,
        blocks,
    );
    let outcome = store.insert_upload(&record)?;
    let record = match outcome {
        InsertOutcome::Inserted => {
            info!(
                file = %file_name,
                blocks = record.blocks.len(),
                size = record.size,
                "Mounted upload"
            );
            record
        }
        // Lost a race with another mount of the same name or first block.
        InsertOutcome::AlreadyExists => {
            let existing = match store.find_upload(&file_name)? {
                Some(existing) => Some(existing),
                None => match record.root_address() {
                    Some(root) => store.find_upload_by_root(root)?,
                    None => None,
                },
            };
            existing.ok_or_else(|| {
                VaultError::Corrupt(format!("{file_name}: conflicting upload vanished"))
            })?
        }
    };
    Ok(MountOutcome { outcome, record })
}

/// Fetches every block of `file_name` in order and decrypts the reassembled
/// artifact into `dest`.
pub async fn retrieve<T>(
    transfer: &T,
    store: &TrackingStore,
    storage: &StorageConfig,
    file_name: &str,
    passphrase: &str,
    dest: &Path,
) -> VaultResult<PathBuf>
where
    T: TransferNetwork + ?Sized,
{
    let record = store
        .find_upload(file_name)?
        .ok_or_else(|| VaultError::UnknownUpload(file_name.to_string()))?;

    let scratch = storage.work_dir.join("retrieve").join(file_name);
    let artifact = storage
        .work_dir
        .join("retrieve")
        .join(format!("{file_name}.{ENCRYPTED_EXTENSION}"));
    let total = assemble_blocks(transfer, &record.blocks, &scratch, &artifact).await?;
    if total != record.size {
        return Err(VaultError::Corrupt(format!(
            "{file_name}: reassembled {total} bytes, expected {}",
            record.size
        )));
    }

    let pass = passphrase.to_string();
    let target = dest.to_path_buf();
    let source = artifact.clone();
    let written = blocking(move || decrypt_file(&source, &target, &pass)).await?;
    if let Err(err) = tokio::fs::remove_file(&artifact).await {
        warn!(file = %artifact.display(), error = %err, "Could not clean reassembled artifact");
    }
    info!(file = %file_name, dest = %written.display(), "Retrieved upload");
    Ok(written)
}

fn file_name_of(source: &Path) -> VaultResult<String> {
    if !source.is_file() {
        return Err(VaultError::MissingFile(source.to_path_buf()));
    }
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VaultError::MissingFile(source.to_path_buf()))
}
