//! Asset discovery.
//!
//! Vendor images and installers are found by globbing an assets directory.
//! All lookups go through [`find_exactly_one`] or [`find_optional`] so the
//! not-found / ambiguous distinction lives in one place.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Base Windows install image.
pub const WINDOWS_ISO_GLOB: &str = "Win11*.iso";
/// Vendor paravirtual driver image.
pub const VIRTIO_ISO_GLOB: &str = "virtio-*.iso";
/// Screen reader installer.
pub const NVDA_GLOB: &str = "nvda_*.exe";
/// SPICE guest agent installer.
pub const SPICE_AGENT_GLOB: &str = "spice-vdagent-x64*msi";
/// WinFsp installer, needed by the virtio-fs service.
pub const WINFSP_GLOB: &str = "winfsp*msi";

fn glob_in(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let dir_str = dir
        .to_str()
        .with_context(|| format!("asset directory is not valid UTF-8: {}", dir.display()))?;
    let full = format!("{}/{}", glob::Pattern::escape(dir_str), pattern);
    let mut matches = glob::glob(&full)
        .with_context(|| format!("invalid asset pattern '{}'", pattern))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("reading assets in {}", dir.display()))?;
    matches.sort();
    Ok(matches)
}

/// Find the single file in `dir` matching `pattern`.
///
/// Zero matches is [`Error::AssetNotFound`]; more than one is
/// [`Error::AmbiguousAsset`].
pub fn find_exactly_one(dir: &Path, pattern: &str) -> Result<PathBuf> {
    match find_optional(dir, pattern)? {
        Some(path) => Ok(path),
        None => Err(Error::AssetNotFound {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
        }
        .into()),
    }
}

/// Find at most one file in `dir` matching `pattern`.
///
/// Zero matches is `Ok(None)`; more than one is still an error.
pub fn find_optional(dir: &Path, pattern: &str) -> Result<Option<PathBuf>> {
    let mut matches = glob_in(dir, pattern)?;
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(Error::AmbiguousAsset {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
            matches,
        }
        .into()),
    }
}

/// Where assets are looked up.
#[derive(Debug, Clone)]
pub struct AssetDirs {
    /// User-configured assets root, if any.
    pub configured: Option<PathBuf>,
    /// Packaged resource directory; its `assets/` subdirectory is the default.
    pub resource_dir: PathBuf,
}

impl AssetDirs {
    /// Packaged default assets directory.
    pub fn packaged(&self) -> PathBuf {
        self.resource_dir.join("assets")
    }

    /// Directory holding the base Windows image.
    ///
    /// A configured root keeps Windows images under `windows/`.
    pub fn windows_images(&self) -> PathBuf {
        match &self.configured {
            Some(dir) => dir.join("windows"),
            None => self.packaged(),
        }
    }

    pub fn find_windows_iso(&self) -> Result<PathBuf> {
        find_exactly_one(&self.windows_images(), WINDOWS_ISO_GLOB)
    }

    pub fn find_virtio_iso(&self) -> Result<PathBuf> {
        find_exactly_one(&self.packaged(), VIRTIO_ISO_GLOB)
    }

    /// Optional installer in the packaged assets directory.
    pub fn find_installer(&self, pattern: &str) -> Result<Option<PathBuf>> {
        find_optional(&self.packaged(), pattern)
    }
}
