//! Content fingerprints for rendered build inputs.
//!
//! Modification times cannot see a changed setting that only alters the
//! rendered answer file. When enabled, the autounattend build stores a
//! SHA-256 over everything it rendered next to the image and treats a
//! mismatch as stale.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Fingerprint file name inside the stamp directory.
pub const INPUTS_HASH_FILE: &str = ".autounattend-inputs.hash";

/// Hex SHA-256 over `parts`, each length-prefixed so boundaries matter.
pub fn fingerprint<I, B>(parts: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Stored fingerprint, or `None` if there is none yet.
pub fn read_stored(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading fingerprint {}", path.display())),
    }
}

pub fn store(path: &Path, fingerprint: &str) -> Result<()> {
    fs::write(path, format!("{}\n", fingerprint))
        .with_context(|| format!("writing fingerprint {}", path.display()))
}
