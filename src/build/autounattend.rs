//! The autounattend image.
//!
//! A small data ISO attached next to the install image. Windows Setup finds
//! `autounattend.xml` at its root, loads drivers from `$WinPEDriver$`, and
//! copies `$OEM$/$$/Setup` to `c:\windows\setup` in the installed system.
//!
//! ```text
//! autounattend.iso
//!     autounattend.xml
//!     $WinPEDriver$/00/ ...
//!     $OEM$/$$/Setup/
//!         specialize.ps1
//!         firstlogon.ps1
//!         virtio-win-gt-x64.msi ...
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::fingerprint::{self, INPUTS_HASH_FILE};
use super::BuildOutcome;
use crate::artifact::extract::Extractor;
use crate::artifact::filesystem::{copy_into, copy_to};
use crate::artifact::iso::{IsoComposer, IsoOptions};
use crate::assets::AssetDirs;
use crate::drivers::{DriverCache, VirtioDrivers};
use crate::freshness::{self, Freshness};
use crate::setup::plugins::{
    AuthorizedKeys, DeviceEncryption, ScreenReader, SshServer, Sysprep, SYSPREP_ANSWER_FILE,
};
use crate::setup::unattend::{AnswerFileRenderer, AUTOUNATTEND_XML};
use crate::setup::{PluginRegistry, WindowsSetupConfig};

/// Image file name inside the stamp directory.
pub const AUTOUNATTEND_ISO: &str = "autounattend.iso";

/// Image directory Setup copies to `c:\windows\setup`.
pub const OEM_SETUP_DIR: &str = "$OEM$/$$/Setup";

/// Image directory Setup loads drivers from during windowsPE.
pub const WINPE_DRIVER_DIR: &str = "$WinPEDriver$";

pub const SPECIALIZE_SCRIPT: &str = "specialize.ps1";
pub const FIRSTLOGON_SCRIPT: &str = "firstlogon.ps1";

/// Everything rendered for one build, ready to stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSetup {
    pub config: WindowsSetupConfig,
    pub autounattend_xml: String,
    pub sysprep_xml: String,
}

impl RenderedSetup {
    fn fingerprint(&self) -> String {
        let paths = |list: &[PathBuf]| {
            list.iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("\n")
        };
        fingerprint::fingerprint([
            self.autounattend_xml.clone(),
            self.sysprep_xml.clone(),
            self.config.specialize_script(),
            self.config.firstlogon_script(),
            paths(&self.config.oem_files),
            paths(&self.config.driver_files),
        ])
    }
}

/// Build step for `<stamp>/autounattend.iso`.
///
/// The stamp directory doubles as the driver cache root.
pub struct AutounattendImage {
    /// Setup defaults the plugins start from.
    pub base_config: WindowsSetupConfig,
    pub assets: AssetDirs,
    pub stamp_dir: PathBuf,
    pub authorized_keys: Option<PathBuf>,
    /// Also compare a fingerprint of the rendered inputs.
    pub track_inputs: bool,
    pub extractor: Extractor,
    pub composer: IsoComposer,
    pub renderer: Box<dyn AnswerFileRenderer>,
}

impl AutounattendImage {
    pub fn image_path(&self) -> PathBuf {
        self.stamp_dir.join(AUTOUNATTEND_ISO)
    }

    pub fn driver_cache(&self) -> DriverCache {
        DriverCache::new(&self.stamp_dir)
    }

    fn sysprep_answer_file(&self) -> PathBuf {
        self.stamp_dir.join(SYSPREP_ANSWER_FILE)
    }

    /// Plugins in application order. Sysprep goes last because it shuts
    /// the machine down at the end of first logon.
    pub fn registry(&self) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(VirtioDrivers {
                cache: self.driver_cache(),
                assets: self.assets.clone(),
            })
            .register(ScreenReader {
                assets_dir: self.assets.packaged(),
            });
        if let Some(keys) = &self.authorized_keys {
            registry.register(AuthorizedKeys {
                keys_file: keys.clone(),
            });
        }
        registry
            .register(SshServer)
            .register(DeviceEncryption)
            .register(Sysprep {
                answer_file: self.sysprep_answer_file(),
            });
        registry
    }

    /// Aggregate the setup config and render both answer files.
    ///
    /// Driver paths resolve against whatever the cache holds right now.
    pub fn render(&self) -> Result<RenderedSetup> {
        let config = self.registry().build_from(self.base_config.clone())?;
        let autounattend_xml = self
            .renderer
            .render(&config, false)
            .context("rendering autounattend.xml")?;
        let sysprep_xml = self
            .renderer
            .render(&config, true)
            .context("rendering sysprep answer file")?;
        Ok(RenderedSetup {
            config,
            autounattend_xml,
            sysprep_xml,
        })
    }

    fn inputs(&self, virtio_iso: &Path) -> Vec<PathBuf> {
        let mut inputs = vec![virtio_iso.to_path_buf()];
        inputs.extend(self.authorized_keys.iter().cloned());
        inputs
    }

    pub fn freshness(&self) -> Result<Freshness> {
        let virtio = self.assets.find_virtio_iso()?;
        let state = freshness::check(&self.image_path(), &self.inputs(&virtio))?;
        if let Freshness::Current(_) = state {
            if self.track_inputs && !self.fingerprint_matches()? {
                return Ok(Freshness::Stale);
            }
        }
        Ok(state)
    }

    fn fingerprint_matches(&self) -> Result<bool> {
        let stored = fingerprint::read_stored(&self.stamp_dir.join(INPUTS_HASH_FILE))?;
        let current = self.render()?.fingerprint();
        debug!(?stored, %current, "comparing answer file fingerprint");
        Ok(stored.as_deref() == Some(current.as_str()))
    }

    /// Populate the driver cache, render, and compose the image unless it
    /// is already current. `force` rebuilds regardless.
    pub fn build(&self, force: bool) -> Result<BuildOutcome> {
        let output = self.image_path();
        if !force {
            if let Freshness::Current(since) = self.freshness()? {
                info!(image = %output.display(), "autounattend image is current, skipping");
                return Ok(BuildOutcome::AlreadyCurrent {
                    path: output,
                    since,
                });
            }
        }

        let virtio = self.assets.find_virtio_iso()?;
        fs::create_dir_all(&self.stamp_dir)
            .with_context(|| format!("creating stamp directory {}", self.stamp_dir.display()))?;
        self.driver_cache().populate(&self.extractor, &virtio)?;

        let rendered = self.render()?;
        write_file(&self.stamp_dir.join(AUTOUNATTEND_XML), &rendered.autounattend_xml)?;
        write_file(&self.sysprep_answer_file(), &rendered.sysprep_xml)?;

        info!(
            oem_files = rendered.config.oem_files.len(),
            drivers = rendered.config.driver_files.len(),
            "composing autounattend image"
        );
        let path = self.composer.compose_with(
            &self.stamp_dir,
            AUTOUNATTEND_ISO,
            IsoOptions::data(),
            |staging| stage(staging, &rendered),
        )?;

        let hash_file = self.stamp_dir.join(INPUTS_HASH_FILE);
        if self.track_inputs {
            fingerprint::store(&hash_file, &rendered.fingerprint())?;
        } else if hash_file.exists() {
            fs::remove_file(&hash_file)
                .with_context(|| format!("removing {}", hash_file.display()))?;
        }

        Ok(BuildOutcome::Built { path })
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

/// Lay out the image root in `staging`.
pub fn stage(staging: &Path, rendered: &RenderedSetup) -> Result<()> {
    let config = &rendered.config;

    let setup_dir = staging.join(OEM_SETUP_DIR);
    fs::create_dir_all(&setup_dir)
        .with_context(|| format!("creating {}", setup_dir.display()))?;
    for file in &config.oem_files {
        debug!(file = %file.display(), "staging OEM file");
        copy_into(file, &setup_dir)
            .with_context(|| format!("staging OEM file {}", file.display()))?;
    }
    write_file(&setup_dir.join(SPECIALIZE_SCRIPT), &config.specialize_script())?;
    write_file(&setup_dir.join(FIRSTLOGON_SCRIPT), &config.firstlogon_script())?;

    let driver_root = staging.join(WINPE_DRIVER_DIR);
    fs::create_dir_all(&driver_root)
        .with_context(|| format!("creating {}", driver_root.display()))?;
    for (index, dir) in config.driver_files.iter().enumerate() {
        copy_to(dir, &driver_root.join(format!("{:02}", index)))
            .with_context(|| format!("staging driver {}", dir.display()))?;
    }

    write_file(&staging.join(AUTOUNATTEND_XML), &rendered.autounattend_xml)
}
