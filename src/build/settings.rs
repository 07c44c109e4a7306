//! Build settings from `winiso-builder.toml`.
//!
//! ```toml
//! [windows]
//! assets_dir = "/srv/assets"
//! windows_version = "w11"
//! generalize = false
//! authorized_keys = "keys/authorized_keys"
//! ```
//!
//! Every key is optional. Relative paths are resolved against the
//! directory holding the config file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::iso::IsoTool;
use crate::assets::AssetDirs;
use crate::setup::{WindowsSetupConfig, DEFAULT_ADMIN_PASSWORD, DEFAULT_PRODUCT_KEY};

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "winiso-builder.toml";

const APP_DIR: &str = "winiso-builder";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    windows: Option<WindowsToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WindowsToml {
    assets_dir: Option<PathBuf>,
    resource_dir: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    windows_version: Option<String>,
    product_key: Option<String>,
    admin_password: Option<String>,
    generalize: Option<bool>,
    enable_sshd: Option<bool>,
    disable_device_encryption: Option<bool>,
    authorized_keys: Option<PathBuf>,
    track_answer_file_inputs: Option<bool>,
    iso_tool: Option<String>,
}

/// Resolved build settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// User assets root; `None` uses the packaged assets.
    pub assets_dir: Option<PathBuf>,
    /// Packaged resources (holds `assets/`).
    pub resource_dir: PathBuf,
    /// Where repacked install images are written.
    pub image_dir: PathBuf,
    /// Per-artifact stamp directories live here.
    pub state_dir: PathBuf,
    pub windows_version: String,
    pub product_key: String,
    pub admin_password: String,
    pub generalize: bool,
    pub enable_sshd: bool,
    pub disable_device_encryption: bool,
    pub authorized_keys: Option<PathBuf>,
    /// Also rebuild the autounattend image when its rendered inputs change.
    pub track_answer_file_inputs: bool,
    pub iso_tool: String,
}

impl Settings {
    /// Settings with every default, rooted in the user cache directory.
    pub fn defaults() -> Result<Self> {
        Self::resolve(WindowsToml::default(), Path::new("."))
    }

    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::defaults();
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir)
            .with_context(|| format!("parsing config '{}'", path.display()))
    }

    /// Parse config text, resolving relative paths against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text)?;
        Self::resolve(parsed.windows.unwrap_or_default(), base_dir)
    }

    fn resolve(raw: WindowsToml, base_dir: &Path) -> Result<Self> {
        let rel = |p: PathBuf| {
            if p.is_absolute() {
                p
            } else {
                base_dir.join(p)
            }
        };

        let image_dir = match raw.image_dir {
            Some(dir) => rel(dir),
            None => app_cache_dir()?.join("windows"),
        };
        let state_dir = match raw.state_dir {
            Some(dir) => rel(dir),
            None => app_cache_dir()?.join("state"),
        };
        let resource_dir = match raw.resource_dir {
            Some(dir) => rel(dir),
            None => dirs::data_dir()
                .map(|d| d.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from("/usr/share").join(APP_DIR)),
        };

        let windows_version = raw.windows_version.unwrap_or_else(|| "w11".to_string());
        if windows_version.trim().is_empty() {
            bail!("windows_version must not be empty");
        }

        Ok(Self {
            assets_dir: raw.assets_dir.map(rel),
            resource_dir,
            image_dir,
            state_dir,
            windows_version,
            product_key: raw
                .product_key
                .unwrap_or_else(|| DEFAULT_PRODUCT_KEY.to_string()),
            admin_password: raw
                .admin_password
                .unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.to_string()),
            generalize: raw.generalize.unwrap_or(true),
            enable_sshd: raw.enable_sshd.unwrap_or(true),
            disable_device_encryption: raw.disable_device_encryption.unwrap_or(true),
            authorized_keys: raw.authorized_keys.map(rel),
            track_answer_file_inputs: raw.track_answer_file_inputs.unwrap_or(false),
            iso_tool: raw.iso_tool.unwrap_or_else(|| "xorriso".to_string()),
        })
    }

    pub fn asset_dirs(&self) -> AssetDirs {
        AssetDirs {
            configured: self.assets_dir.clone(),
            resource_dir: self.resource_dir.clone(),
        }
    }

    pub fn iso_tool(&self) -> IsoTool {
        IsoTool::from_name(&self.iso_tool)
    }

    /// Starting point for plugin aggregation.
    pub fn setup_config(&self) -> WindowsSetupConfig {
        WindowsSetupConfig {
            product_key: self.product_key.clone(),
            admin_password: self.admin_password.clone(),
            generalize: self.generalize,
            enable_sshd: self.enable_sshd,
            disable_device_encryption: self.disable_device_encryption,
            ..WindowsSetupConfig::new(self.windows_version.clone())
        }
    }

    /// Stamp directory of the repacked install image; holds its transient `extract/`.
    pub fn install_stamp(&self) -> PathBuf {
        self.state_dir.join("no_prompt_install")
    }

    /// Stamp directory of the autounattend image; also the driver cache root.
    pub fn autounattend_stamp(&self) -> PathBuf {
        self.state_dir.join("autounattend_cd")
    }
}

fn app_cache_dir() -> Result<PathBuf> {
    match dirs::cache_dir() {
        Some(dir) => Ok(dir.join(APP_DIR)),
        None => bail!("cannot determine the user cache directory; set image_dir and state_dir"),
    }
}
