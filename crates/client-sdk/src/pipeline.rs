//! Streaming file encryption.
//!
//! Encrypt: read -> AES-256-GCM (STREAM construction) -> gzip -> write.
//! Decrypt is the exact inverse. Memory use is bounded by one frame.
//!
//! Plaintext layout before compression:
//! `MAGIC | version | salt[16] | nonce[7] | (len:u32le | frame)*`
//! The final frame is sealed with the STREAM "last" flag, so a stream cut
//! at a frame boundary still fails authentication.

use crate::error::{VaultError, VaultResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, KeyInit};
use argon2::Argon2;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::{rngs::OsRng, RngCore};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const ENCRYPTED_EXTENSION: &str = "hvlt";

const MAGIC: &[u8; 4] = b"HVLT";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const STREAM_NONCE_LEN: usize = 7;
const FRAME_LEN: usize = 64 * 1024;
const TAG_LEN: usize = 16;

/// Encrypts `source` into `out_dir/<file name>.hvlt` and returns that path.
pub fn encrypt_file(source: &Path, out_dir: &Path, passphrase: &str) -> VaultResult<PathBuf> {
    check_passphrase(passphrase)?;
    let input = open_source(source)?;
    let file_name = source
        .file_name()
        .ok_or_else(|| VaultError::MissingFile(source.to_path_buf()))?;
    fs::create_dir_all(out_dir)?;
    let dest = out_dir.join(format!(
        "{}.{ENCRYPTED_EXTENSION}",
        file_name.to_string_lossy()
    ));

    write_atomically(&dest, |out| {
        let mut gz = GzEncoder::new(BufWriter::new(out), Compression::default());
        encrypt_stream(BufReader::new(input), &mut gz, passphrase)?;
        let mut buffered = gz.finish()?;
        buffered.flush()?;
        Ok(())
    })?;
    Ok(dest)
}

/// Decrypts an artifact produced by [`encrypt_file`] into `dest`.
pub fn decrypt_file(source: &Path, dest: &Path, passphrase: &str) -> VaultResult<PathBuf> {
    check_passphrase(passphrase)?;
    let input = open_source(source)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    write_atomically(dest, |out| {
        let mut writer = BufWriter::new(out);
        decrypt_stream(GzDecoder::new(BufReader::new(input)), &mut writer, passphrase)?;
        writer.flush()?;
        Ok(())
    })?;
    Ok(dest.to_path_buf())
}

pub fn encrypt_stream<R: Read, W: Write>(
    mut input: R,
    output: &mut W,
    passphrase: &str,
) -> VaultResult<()> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; STREAM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = build_cipher(passphrase, &salt)?;
    let mut encryptor =
        EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));

    output.write_all(MAGIC)?;
    output.write_all(&[FORMAT_VERSION])?;
    output.write_all(&salt)?;
    output.write_all(&nonce)?;

    let mut current = vec![0u8; FRAME_LEN];
    let mut next = vec![0u8; FRAME_LEN];
    let mut current_len = read_full(&mut input, &mut current)?;
    loop {
        let next_len = if current_len == FRAME_LEN {
            read_full(&mut input, &mut next)?
        } else {
            0
        };
        if next_len == 0 {
            let sealed = encryptor
                .encrypt_last(&current[..current_len])
                .map_err(|_| VaultError::Crypto("encryption failed".to_string()))?;
            write_frame(output, &sealed)?;
            return Ok(());
        }
        let sealed = encryptor
            .encrypt_next(&current[..current_len])
            .map_err(|_| VaultError::Crypto("encryption failed".to_string()))?;
        write_frame(output, &sealed)?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }
}

pub fn decrypt_stream<R: Read, W: Write>(
    mut input: R,
    output: &mut W,
    passphrase: &str,
) -> VaultResult<()> {
    let mut magic = [0u8; 4];
    read_exact_or_corrupt(&mut input, &mut magic, "header")?;
    if &magic != MAGIC {
        return Err(VaultError::Corrupt("bad magic".to_string()));
    }
    let mut version = [0u8; 1];
    read_exact_or_corrupt(&mut input, &mut version, "header")?;
    if version[0] != FORMAT_VERSION {
        return Err(VaultError::Corrupt(format!(
            "unsupported format version {}",
            version[0]
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    read_exact_or_corrupt(&mut input, &mut salt, "salt")?;
    let mut nonce = [0u8; STREAM_NONCE_LEN];
    read_exact_or_corrupt(&mut input, &mut nonce, "nonce")?;

    let cipher = build_cipher(passphrase, &salt)?;
    let mut decryptor =
        DecryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));

    let mut frame = read_frame(&mut input)?
        .ok_or_else(|| VaultError::Corrupt("stream has no frames".to_string()))?;
    loop {
        match read_frame(&mut input)? {
            Some(following) => {
                let plain = decryptor
                    .decrypt_next(frame.as_slice())
                    .map_err(|_| VaultError::Crypto("decryption failed".to_string()))?;
                output.write_all(&plain)?;
                frame = following;
            }
            None => {
                // A truncated stream ends on a frame that was not sealed as last.
                let plain = decryptor.decrypt_last(frame.as_slice()).map_err(|_| {
                    VaultError::Crypto("decryption failed (wrong passphrase or truncated stream)".to_string())
                })?;
                output.write_all(&plain)?;
                return Ok(());
            }
        }
    }
}

fn build_cipher(passphrase: &str, salt: &[u8]) -> VaultResult<Aes256Gcm> {
    let key = derive_key(passphrase, salt)?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::Crypto(e.to_string()))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> VaultResult<[u8; 32]> {
    let argon2 = Argon2::default();
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| VaultError::Crypto(format!("argon2 key derivation failed: {e}")))?;
    Ok(key)
}

fn check_passphrase(passphrase: &str) -> VaultResult<()> {
    if passphrase.is_empty() {
        return Err(VaultError::Crypto("passphrase must not be empty".to_string()));
    }
    Ok(())
}

fn open_source(source: &Path) -> VaultResult<File> {
    File::open(source).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => VaultError::MissingFile(source.to_path_buf()),
        _ => VaultError::Io(e),
    })
}

/// Runs `write` against `<dest>.part`, then syncs and renames it into place.
/// On failure the partial file is removed.
fn write_atomically<F>(dest: &Path, write: F) -> VaultResult<()>
where
    F: FnOnce(&mut File) -> VaultResult<()>,
{
    let part = part_path(dest);
    let result = (|| -> VaultResult<()> {
        let mut file = File::create(&part)?;
        write(&mut file)?;
        file.sync_all()?;
        fs::rename(&part, dest)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&part);
    }
    result
}

pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn write_frame<W: Write>(output: &mut W, sealed: &[u8]) -> io::Result<()> {
    output.write_all(&(sealed.len() as u32).to_le_bytes())?;
    output.write_all(sealed)
}

fn read_frame<R: Read>(input: &mut R) -> VaultResult<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    let got = read_full(input, &mut len_bytes).map_err(corrupt_on_eof)?;
    if got == 0 {
        return Ok(None);
    }
    if got < len_bytes.len() {
        return Err(VaultError::Corrupt("truncated frame header".to_string()));
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if !(TAG_LEN..=FRAME_LEN + TAG_LEN).contains(&len) {
        return Err(VaultError::Corrupt(format!("invalid frame length {len}")));
    }
    let mut frame = vec![0u8; len];
    read_exact_or_corrupt(input, &mut frame, "frame")?;
    Ok(Some(frame))
}

fn read_exact_or_corrupt<R: Read>(input: &mut R, buf: &mut [u8], what: &str) -> VaultResult<()> {
    let got = read_full(input, buf).map_err(corrupt_on_eof)?;
    if got < buf.len() {
        return Err(VaultError::Corrupt(format!("truncated {what}")));
    }
    Ok(())
}

/// Reads until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// gzip reports a cut-off member as UnexpectedEof / InvalidInput.
fn corrupt_on_eof(err: io::Error) -> VaultError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            VaultError::Corrupt(err.to_string())
        }
        _ => VaultError::Io(err),
    }
}
