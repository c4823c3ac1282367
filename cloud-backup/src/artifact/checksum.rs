//! SHA-256 sidecar records in `sha256sum` format.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use super::checksum_name;

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn file_name(path: &Path) -> io::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file path: {}", path.display()),
            )
        })
}

/// Write `<artifact>.sha256` next to the artifact.
///
/// The record holds the bare file name so `sha256sum -c` works from the
/// directory the pair is downloaded into.
pub fn write_checksum_file(artifact: &Path) -> io::Result<(PathBuf, String)> {
    let digest = sha256_file(artifact)?;
    let name = file_name(artifact)?;
    let record_path = artifact.with_file_name(checksum_name(&name));
    std::fs::write(&record_path, format!("{}  {}\n", digest, name))?;
    Ok((record_path, digest))
}

/// Check an artifact against its sidecar record
pub fn verify_checksum_file(artifact: &Path, record: &Path) -> io::Result<bool> {
    let content = std::fs::read_to_string(record)?;
    let expected = content
        .split_whitespace()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty checksum record"))?;
    Ok(sha256_file(artifact)?.eq_ignore_ascii_case(expected))
}
