use crate::blocking;
use crate::error::{VaultError, VaultResult};
use crate::transfer::TransferNetwork;
use hostvault_protocol::BlockAddress;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Splits `path` into `block_size` files under `blocks_dir`, streaming.
/// An empty input yields no blocks.
pub fn split_into_blocks(
    path: &Path,
    blocks_dir: &Path,
    block_size: usize,
) -> io::Result<Vec<(PathBuf, u64)>> {
    if block_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block_size must be > 0",
        ));
    }
    fs::create_dir_all(blocks_dir)?;
    let mut input = File::open(path)?;
    let mut buf = vec![0u8; block_size];
    let mut out = Vec::new();
    loop {
        let mut filled = 0;
        while filled < block_size {
            match input.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            break;
        }
        let block_path = blocks_dir.join(format!("{:06}.blk", out.len()));
        fs::write(&block_path, &buf[..filled])?;
        out.push((block_path, filled as u64));
        if filled < block_size {
            break;
        }
    }
    Ok(out)
}

/// Turns an encrypted artifact into ordered `(address, size)` pairs, using
/// the transfer network to address (and store) every block.
pub async fn chunk_file<T>(
    transfer: &T,
    encrypted: &Path,
    blocks_dir: &Path,
    block_size: usize,
) -> VaultResult<Vec<(BlockAddress, u64)>>
where
    T: TransferNetwork + ?Sized,
{
    if !encrypted.exists() {
        return Err(VaultError::MissingFile(encrypted.to_path_buf()));
    }
    let source = encrypted.to_path_buf();
    let dir = blocks_dir.to_path_buf();
    let pieces = blocking(move || Ok(split_into_blocks(&source, &dir, block_size)?)).await?;

    let mut blocks = Vec::with_capacity(pieces.len());
    for (block_path, size) in pieces {
        let address = transfer.add(&block_path).await?;
        blocks.push((address, size));
    }
    info!(
        file = %encrypted.display(),
        blocks = blocks.len(),
        "Chunked encrypted artifact"
    );
    Ok(blocks)
}

/// Fetches `blocks` in order and concatenates them into `dest`.
pub async fn assemble_blocks<T>(
    transfer: &T,
    blocks: &[BlockAddress],
    scratch_dir: &Path,
    dest: &Path,
) -> VaultResult<u64>
where
    T: TransferNetwork + ?Sized,
{
    tokio::fs::create_dir_all(scratch_dir).await?;
    let mut fetched = Vec::with_capacity(blocks.len());
    for (index, address) in blocks.iter().enumerate() {
        let block_path = scratch_dir.join(format!("{index:06}-{address}"));
        transfer.fetch(address, &block_path).await?;
        fetched.push(block_path);
    }

    let dest_owned = dest.to_path_buf();
    blocking(move || Ok(concat_files(&fetched, &dest_owned)?)).await
}

fn concat_files(parts: &[PathBuf], dest: &Path) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(dest)?);
    let mut total = 0u64;
    for part in parts {
        let mut input = File::open(part)?;
        total += io::copy(&mut input, &mut out)?;
        fs::remove_file(part)?;
    }
    out.flush()?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(total)
}
