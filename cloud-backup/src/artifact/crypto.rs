//! Passphrase-based artifact encryption.
//!
//! Container layout:
//!
//! ```text
//! "CBAK" | version (1) | salt (16) | nonce prefix (7) | chunk*
//! ```
//!
//! The plaintext is split into 64 KiB chunks, each sealed with AES-256-GCM
//! under a key derived by Argon2id from the passphrase and the random salt.
//! A chunk nonce is `prefix || counter (u32 BE) || last flag`, so reordered,
//! dropped or truncated chunks fail authentication. Fresh salt and prefix on
//! every encryption make identical inputs produce different ciphertexts.

use aes_gcm::{
    aead::{Aead, OsRng, rand_core::RngCore},
    Aes256Gcm, KeyInit, Nonce,
};
use argon2::Argon2;
use secrecy::{ExposeSecret, SecretString};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"CBAK";
const VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const NONCE_PREFIX_SIZE: usize = 7;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Not an encrypted artifact: {0}")]
    Format(String),

    #[error("Decryption failed: wrong passphrase or corrupted artifact")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,
}

fn derive_cipher(passphrase: &SecretString, salt: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    key.fill(0);
    Ok(cipher)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..NONCE_PREFIX_SIZE + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Read until `buf` is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything from `reader` into `writer`
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    passphrase: &SecretString,
) -> Result<(), CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut prefix = [0u8; NONCE_PREFIX_SIZE];
    OsRng.fill_bytes(&mut prefix);

    let cipher = derive_cipher(passphrase, &salt)?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;
    writer.write_all(&salt)?;
    writer.write_all(&prefix)?;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut len = read_full(&mut reader, &mut current)?;
    let mut counter: u32 = 0;

    loop {
        // A full chunk may be followed by more data; look ahead to decide
        // whether this one is the last.
        let next_len = if len == CHUNK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = chunk_nonce(&prefix, counter, last);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), &current[..len])
            .map_err(|_| CryptoError::Encryption)?;
        writer.write_all(&sealed)?;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        len = next_len;
        counter = counter.checked_add(1).ok_or(CryptoError::Encryption)?;
    }

    writer.flush()?;
    Ok(())
}

/// Decrypt a container from `reader` into `writer`.
///
/// Only authenticated chunks are written. On error the writer may hold a
/// verified prefix of the plaintext; callers writing to files should discard
/// the output, as [`decrypt_file`] does.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    passphrase: &SecretString,
) -> Result<(), CryptoError> {
    let mut header = [0u8; 4 + 1 + SALT_SIZE + NONCE_PREFIX_SIZE];
    if read_full(&mut reader, &mut header)? < header.len() {
        return Err(CryptoError::Format("truncated header".into()));
    }
    if &header[..4] != MAGIC {
        return Err(CryptoError::Format("bad magic".into()));
    }
    if header[4] != VERSION {
        return Err(CryptoError::Format(format!("unsupported version {}", header[4])));
    }
    let salt = &header[5..5 + SALT_SIZE];
    let mut prefix = [0u8; NONCE_PREFIX_SIZE];
    prefix.copy_from_slice(&header[5 + SALT_SIZE..]);

    let cipher = derive_cipher(passphrase, salt)?;

    let mut current = vec![0u8; SEALED_CHUNK_SIZE];
    let mut next = vec![0u8; SEALED_CHUNK_SIZE];
    let mut len = read_full(&mut reader, &mut current)?;
    let mut counter: u32 = 0;

    loop {
        if len < TAG_SIZE {
            return Err(CryptoError::Format("truncated chunk".into()));
        }
        let next_len = if len == SEALED_CHUNK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = chunk_nonce(&prefix, counter, last);
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), &current[..len])
            .map_err(|_| CryptoError::Authentication)?;
        writer.write_all(&plain)?;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        len = next_len;
        counter = counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::Format("too many chunks".into()))?;
    }

    writer.flush()?;
    Ok(())
}

/// Encrypt `input` into a new file at `output`
pub fn encrypt_file(input: &Path, output: &Path, passphrase: &SecretString) -> Result<(), CryptoError> {
    let reader = BufReader::new(File::open(input)?);
    let file = File::create(output)?;
    let mut writer = BufWriter::new(file);
    let result = encrypt_stream(reader, &mut writer, passphrase);
    if result.is_err() {
        drop(writer);
        let _ = std::fs::remove_file(output);
        return result;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Decrypt `input` into `output`. Nothing is left at `output` on failure.
pub fn decrypt_file(input: &Path, output: &Path, passphrase: &SecretString) -> Result<(), CryptoError> {
    let reader = BufReader::new(File::open(input)?);
    let partial = output.with_extension("partial");
    let mut writer = BufWriter::new(File::create(&partial)?);

    match decrypt_stream(reader, &mut writer, passphrase) {
        Ok(()) => {
            drop(writer);
            std::fs::rename(&partial, output)?;
            Ok(())
        }
        Err(e) => {
            drop(writer);
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}
