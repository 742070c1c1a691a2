//! SHA-256 verification against a `<hash>  <file>` checksum list, and
//! crash-safe file writes.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::ReleaseError;

pub fn sha256_file(path: &Path) -> Result<String, ReleaseError> {
    let mut file = File::open(path).map_err(|e| ReleaseError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| ReleaseError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// The expected hash for `binary_name`: the first field of the first line
/// mentioning it.
pub fn expected_hash(checksums: &str, binary_name: &str) -> Option<String> {
    checksums
        .lines()
        .map(str::trim)
        .filter(|line| line.contains(binary_name))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let hash = fields.next()?;
            fields.next().map(|_| hash.to_ascii_lowercase())
        })
}

pub fn verify_checksum(file: &Path, checksums_path: &Path, binary_name: &str) -> Result<(), ReleaseError> {
    let computed = sha256_file(file)?;
    let checksums = std::fs::read_to_string(checksums_path).map_err(|e| ReleaseError::io(checksums_path, e))?;
    let expected =
        expected_hash(&checksums, binary_name).ok_or_else(|| ReleaseError::ChecksumNotFound(binary_name.to_string()))?;
    if expected == computed {
        Ok(())
    } else {
        Err(ReleaseError::ChecksumMismatch { expected, computed })
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    path.with_file_name(format!(".{}.tmp", name))
}

/// Writes to a sibling temp file, then renames over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ReleaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ReleaseError::io(parent, e))?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, contents).map_err(|e| ReleaseError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        std::fs::remove_file(&tmp).ok();
        ReleaseError::io(path, e)
    })
}
