use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> bool {
    sha256_hex(bytes).eq_ignore_ascii_case(expected_hex.trim())
}

/// Streams `reader` through SHA-256 and returns the lowercase hex digest.
pub fn verify_sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed reading data for sha256")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns whether the file's digest matches, plus the digest actually seen.
pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<(bool, String)> {
    let file = File::open(path)
        .with_context(|| format!("failed opening file for sha256: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let actual = verify_sha256_reader(&mut reader)
        .with_context(|| format!("failed hashing file: {}", path.display()))?;
    Ok((actual.eq_ignore_ascii_case(expected_hex.trim()), actual))
}
