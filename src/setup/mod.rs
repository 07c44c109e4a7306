//! Windows unattended-setup configuration.
//!
//! A [`WindowsSetupConfig`] is assembled once per build by running every
//! registered [`ConfigPlugin`] over it, in registration order. Plugins only
//! append to the config's lists or flip its flags; the lists are never
//! sorted or deduplicated, so the order plugins were registered in is the
//! order their files are staged and their scriptlets run.
//!
//! # Example
//!
//! ```rust
//! use winiso_builder::setup::{ConfigPlugin, PluginRegistry, WindowsSetupConfig};
//!
//! struct Hostname;
//!
//! impl ConfigPlugin for Hostname {
//!     fn name(&self) -> &str { "hostname" }
//!     fn apply(&self, config: &mut WindowsSetupConfig) -> anyhow::Result<()> {
//!         config.specialize_powershell.push("Rename-Computer -NewName builder".into());
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = PluginRegistry::new();
//! registry.register(Hostname);
//! let config = registry.build("w11").unwrap();
//! assert_eq!(config.specialize_powershell.len(), 1);
//! ```

pub mod plugins;
pub mod unattend;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

/// Generic Windows 11 Pro key. Selects the edition to install; it does not activate.
pub const DEFAULT_PRODUCT_KEY: &str = "VK7JG-NPHTM-C97JM-9MPGT-3V66T";

/// Password of the local administrator account.
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

/// Guest directory that OEM payloads land in.
pub const GUEST_SETUP_DIR: &str = r"c:\windows\setup";

/// Guest path of a file staged as an OEM payload.
pub fn guest_setup_path(file_name: &str) -> String {
    format!(r"{}\{}", GUEST_SETUP_DIR, file_name)
}

/// What Windows Setup should do, as contributed by plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsSetupConfig {
    /// Windows version tag (`w11`); selects version-specific driver paths.
    pub windows_version: String,
    pub product_key: String,
    pub admin_password: String,
    /// Run sysprep `/generalize` after the first logon.
    pub generalize: bool,
    pub enable_sshd: bool,
    /// Stop Windows from turning on BitLocker device encryption.
    pub disable_device_encryption: bool,
    /// Files copied to `c:\windows\setup`.
    pub oem_files: Vec<PathBuf>,
    /// Directories offered to the driver store during setup.
    pub driver_files: Vec<PathBuf>,
    /// Fragments joined into the specialize-pass script.
    pub specialize_powershell: Vec<String>,
    /// Fragments joined into the first-logon script.
    pub firstlogon_powershell: Vec<String>,
}

impl WindowsSetupConfig {
    pub fn new(windows_version: impl Into<String>) -> Self {
        Self {
            windows_version: windows_version.into(),
            product_key: DEFAULT_PRODUCT_KEY.to_string(),
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            generalize: true,
            enable_sshd: true,
            disable_device_encryption: true,
            oem_files: Vec::new(),
            driver_files: Vec::new(),
            specialize_powershell: Vec::new(),
            firstlogon_powershell: Vec::new(),
        }
    }

    /// The specialize-pass script: one fragment per line, then a blank line.
    pub fn specialize_script(&self) -> String {
        join_script(&self.specialize_powershell)
    }

    /// The first-logon script: one fragment per line, then a blank line.
    pub fn firstlogon_script(&self) -> String {
        join_script(&self.firstlogon_powershell)
    }
}

fn join_script(fragments: &[String]) -> String {
    let mut script = String::new();
    for fragment in fragments {
        script.push_str(fragment);
        script.push('\n');
    }
    script.push('\n');
    script
}

/// A contributor to the setup configuration.
///
/// Implementations may append to any list or change any flag, but must
/// not remove or reorder entries other plugins added.
pub trait ConfigPlugin {
    /// Name for logging and identification.
    fn name(&self) -> &str;

    /// Contribute to `config`.
    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()>;
}

/// Plugins applied in the order they were registered.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn ConfigPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: impl ConfigPlugin + 'static) -> &mut Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Build a config for `windows_version` with default settings.
    pub fn build(&self, windows_version: &str) -> Result<WindowsSetupConfig> {
        self.build_from(WindowsSetupConfig::new(windows_version))
    }

    /// Run every plugin, one at a time, over `config`.
    pub fn build_from(&self, mut config: WindowsSetupConfig) -> Result<WindowsSetupConfig> {
        for plugin in &self.plugins {
            debug!(plugin = plugin.name(), "applying config plugin");
            plugin
                .apply(&mut config)
                .with_context(|| format!("applying config plugin '{}'", plugin.name()))?;
        }
        Ok(config)
    }
}
