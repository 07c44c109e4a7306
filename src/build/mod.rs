//! Build orchestration.
//!
//! Two build products, each gated on its own freshness:
//!
//! - [`install_image`] - the vendor install image repacked to boot
//!   without a key press, at `<image_dir>/<stem>_noprompt.iso`
//! - [`autounattend`] - the answer file, drivers, and first-logon payloads,
//!   at `<state_dir>/autounattend_cd/autounattend.iso`
//!
//! [`WindowsBuild`] wires both from [`Settings`] and exposes them to a VM
//! definition as [`DiskDescriptor`]s.

pub mod autounattend;
pub mod disk;
pub mod fingerprint;
pub mod install_image;
pub mod settings;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::artifact::extract::Extractor;
use crate::artifact::iso::IsoComposer;
use crate::drivers::DriverCache;
use crate::setup::unattend::UnattendXml;

pub use autounattend::AutounattendImage;
pub use disk::{base_image_disks, DiskDescriptor};
pub use install_image::NoPromptInstallImage;
pub use settings::Settings;

/// What a build step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Output was newer than every input; nothing ran.
    AlreadyCurrent { path: PathBuf, since: SystemTime },
    Built { path: PathBuf },
}

impl BuildOutcome {
    pub fn path(&self) -> &Path {
        match self {
            BuildOutcome::AlreadyCurrent { path, .. } | BuildOutcome::Built { path } => path,
        }
    }

    pub fn was_built(&self) -> bool {
        matches!(self, BuildOutcome::Built { .. })
    }
}

/// Build steps for one settings file.
#[derive(Debug, Clone)]
pub struct WindowsBuild {
    settings: Settings,
    extractor: Extractor,
    composer: IsoComposer,
}

impl WindowsBuild {
    /// Detect the extraction strategy and use the configured image tool.
    pub fn new(settings: Settings) -> Self {
        let composer = IsoComposer::new(settings.iso_tool());
        Self::with_tools(settings, Extractor::default(), composer)
    }

    pub fn with_tools(settings: Settings, extractor: Extractor, composer: IsoComposer) -> Self {
        Self {
            settings,
            extractor,
            composer,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn install_image(&self) -> NoPromptInstallImage {
        NoPromptInstallImage {
            assets: self.settings.asset_dirs(),
            image_dir: self.settings.image_dir.clone(),
            stamp_dir: self.settings.install_stamp(),
            extractor: self.extractor.clone(),
            composer: self.composer.clone(),
        }
    }

    pub fn autounattend(&self) -> AutounattendImage {
        AutounattendImage {
            base_config: self.settings.setup_config(),
            assets: self.settings.asset_dirs(),
            stamp_dir: self.settings.autounattend_stamp(),
            authorized_keys: self.settings.authorized_keys.clone(),
            track_inputs: self.settings.track_answer_file_inputs,
            extractor: self.extractor.clone(),
            composer: self.composer.clone(),
            renderer: Box::new(UnattendXml),
        }
    }

    pub fn driver_cache(&self) -> DriverCache {
        DriverCache::new(self.settings.autounattend_stamp())
    }

    /// Refill the driver cache from the vendor driver image.
    pub fn populate_drivers(&self) -> Result<DriverCache> {
        let cache = self.driver_cache();
        let virtio = self.settings.asset_dirs().find_virtio_iso()?;
        cache.populate(&self.extractor, &virtio)?;
        Ok(cache)
    }

    /// Both images, building whichever is not current.
    pub fn build_all(&self, force: bool) -> Result<(BuildOutcome, BuildOutcome)> {
        let install = self.install_image().build(force)?;
        let autounattend = self.autounattend().build(force)?;
        Ok((install, autounattend))
    }

    /// Disk descriptors for a base-image VM, from the expected output paths.
    pub fn disks(&self) -> Result<Vec<DiskDescriptor>> {
        Ok(base_image_disks(
            &self.install_image().image_path()?,
            &self.autounattend().image_path(),
        ))
    }
}
