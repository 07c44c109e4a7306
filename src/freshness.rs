//! Build freshness by modification time.
//!
//! An output is current when it exists and no input is strictly newer.
//! Equal timestamps count as current.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Freshness of a build output relative to its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The output does not exist.
    Absent,
    /// Some input is newer than the output.
    Stale,
    /// The output is up to date; carries its modification time.
    Current(SystemTime),
}

impl Freshness {
    pub fn needs_build(&self) -> bool {
        !matches!(self, Freshness::Current(_))
    }
}

fn mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("reading modification time of {}", path.display()))
}

/// Classify `output` against `inputs`.
///
/// Once the output exists every input must exist too; a missing input is
/// an error rather than a reason to rebuild.
pub fn check<P: AsRef<Path>>(output: &Path, inputs: &[P]) -> Result<Freshness> {
    if !output.exists() {
        return Ok(Freshness::Absent);
    }
    let output_time = mtime(output)?;

    let mut newest_input = None;
    for input in inputs {
        let t = mtime(input.as_ref())?;
        newest_input = newest_input.max(Some(t));
    }

    match newest_input {
        Some(t) if t > output_time => Ok(Freshness::Stale),
        _ => Ok(Freshness::Current(output_time)),
    }
}

/// Whether `output` must be rebuilt from `inputs`.
pub fn is_stale<P: AsRef<Path>>(output: &Path, inputs: &[P]) -> Result<bool> {
    Ok(check(output, inputs)?.needs_build())
}

#[cfg(test)]
pub(crate) fn set_mtime(path: &Path, time: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}
