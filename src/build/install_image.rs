//! The repacked Windows install image.
//!
//! Stock Windows media waits for a key press before booting from CD. The
//! repack rebuilds the vendor image with the no-prompt EFI boot image so
//! an unattended VM install starts on its own.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use super::BuildOutcome;
use crate::artifact::extract::Extractor;
use crate::artifact::iso::{IsoComposer, IsoOptions};
use crate::assets::AssetDirs;
use crate::freshness::{self, Freshness};

/// Suffix added to the vendor image's stem.
pub const NOPROMPT_SUFFIX: &str = "_noprompt";

/// `Win11_x64.iso` -> `Win11_x64_noprompt.iso`.
pub fn noprompt_name(base_image: &Path) -> Result<String> {
    let stem = base_image
        .file_stem()
        .with_context(|| format!("image has no file name: {}", base_image.display()))?;
    Ok(format!("{}{}.iso", stem.to_string_lossy(), NOPROMPT_SUFFIX))
}

/// Build step for `<image_dir>/<base stem>_noprompt.iso`.
///
/// The vendor image is unpacked under `<stamp_dir>/extract` while the
/// repack runs.
#[derive(Debug, Clone)]
pub struct NoPromptInstallImage {
    pub assets: AssetDirs,
    pub image_dir: PathBuf,
    pub stamp_dir: PathBuf,
    pub extractor: Extractor,
    pub composer: IsoComposer,
}

impl NoPromptInstallImage {
    /// The vendor Windows image this step repacks.
    pub fn find_base_cd(&self) -> Result<PathBuf> {
        self.assets.find_windows_iso()
    }

    pub fn image_path(&self) -> Result<PathBuf> {
        let base = self.find_base_cd()?;
        Ok(self.image_dir.join(noprompt_name(&base)?))
    }

    pub fn freshness(&self) -> Result<Freshness> {
        let base = self.find_base_cd()?;
        freshness::check(&self.image_dir.join(noprompt_name(&base)?), &[base])
    }

    /// Repack the vendor image unless the repack is already current.
    ///
    /// `force` rebuilds regardless of timestamps.
    pub fn build(&self, force: bool) -> Result<BuildOutcome> {
        let base = self.find_base_cd()?;
        let name = noprompt_name(&base)?;
        let output = self.image_dir.join(&name);

        if !force {
            if let Freshness::Current(since) = freshness::check(&output, &[&base])? {
                info!(image = %output.display(), "install image is current, skipping");
                return Ok(BuildOutcome::AlreadyCurrent {
                    path: output,
                    since,
                });
            }
        }

        info!(base = %base.display(), image = %output.display(), "repacking install image");
        let extracted = self
            .extractor
            .extract(&base, &self.stamp_dir.join("extract"))?;
        let path = self.composer.compose_with(
            &self.image_dir,
            &name,
            IsoOptions::windows_install(extracted.path()),
            |_| Ok(()),
        )?;
        extracted.finish()?;

        Ok(BuildOutcome::Built { path })
    }
}
