//! Paravirtual driver and guest payload cache.
//!
//! Drivers and guest-agent installers are pulled out of the vendor
//! `virtio-*.iso` into a cache directory:
//!
//! ```text
//! <cache>/
//!     extract/                      (transient, while the image is unpacked)
//!     drivers/<name>/<tag>/amd64/   (one tree per driver)
//!     oem/<installer>.msi
//! ```
//!
//! [`DriverCache::populate`] replaces `drivers/` and `oem/` wholesale on
//! every call. It takes no lock itself: callers that may run concurrently
//! hold [`DriverCache::lock`] around it.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::artifact::extract::Extractor;
use crate::artifact::filesystem::{copy_into, replace_dir};
use crate::assets::{AssetDirs, SPICE_AGENT_GLOB, WINFSP_GLOB};
use crate::error::Error;
use crate::setup::plugins::{install_msi, MsiInstall};
use crate::setup::{ConfigPlugin, WindowsSetupConfig};

/// Driver directories taken from the virtio image.
pub const DEFAULT_DRIVERS: &[&str] = &["vioscsi", "qxl", "qxldod", "NetKVM"];

/// Installer payloads taken from the virtio image, relative to its root.
pub const DEFAULT_PAYLOADS: &[&str] = &["virtio-win-gt-x64.msi", "guest-agent/qemu-ga-x86_64.msi"];

/// Architecture directory used for every driver.
pub const DRIVER_ARCH: &str = "amd64";

/// Windows version -> driver directory tag on the virtio image.
///
/// New Windows versions are supported by adding a row.
pub const DRIVER_VERSION_TAGS: &[(&str, &str)] = &[("w11", "w11")];

/// Driver directory tag for `windows_version`.
pub fn driver_version_tag(windows_version: &str) -> Result<&'static str> {
    DRIVER_VERSION_TAGS
        .iter()
        .find(|(version, _)| *version == windows_version)
        .map(|(_, tag)| *tag)
        .ok_or_else(|| Error::UnsupportedVersion(windows_version.to_string()).into())
}

/// On-disk cache of extracted drivers and payloads.
#[derive(Debug, Clone)]
pub struct DriverCache {
    root: PathBuf,
    drivers: Vec<String>,
    payloads: Vec<String>,
}

impl DriverCache {
    /// Cache with the default driver and payload sets.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_sets(root, DEFAULT_DRIVERS, DEFAULT_PAYLOADS)
    }

    pub fn with_sets(root: impl Into<PathBuf>, drivers: &[&str], payloads: &[&str]) -> Self {
        Self {
            root: root.into(),
            drivers: drivers.iter().map(|d| d.to_string()).collect(),
            payloads: payloads.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn drivers_dir(&self) -> PathBuf {
        self.root.join("drivers")
    }

    pub fn oem_dir(&self) -> PathBuf {
        self.root.join("oem")
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extract")
    }

    /// Cached location of each payload, in payload order.
    pub fn payload_paths(&self) -> Vec<PathBuf> {
        let oem = self.oem_dir();
        self.payloads
            .iter()
            .filter_map(|p| Path::new(p).file_name().map(|n| oem.join(n)))
            .collect()
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Take the cache's exclusive lock, failing if another process holds it.
    pub fn lock(&self) -> Result<CacheLock> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating cache root {}", self.root.display()))?;
        let path = self.lock_path();
        // The lock file is never unlinked; a second process could otherwise
        // lock a fresh file at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!("driver cache is locked by another build: {}", path.display());
        }
        Ok(CacheLock { file })
    }

    /// Extract `image` and refill the cache from it.
    pub fn populate(&self, extractor: &Extractor, image: &Path) -> Result<()> {
        extract_drivers(
            extractor,
            image,
            &self.root,
            &self.drivers[..],
            &self.payloads[..],
        )
    }

    /// Cached driver directories for `windows_version`, in driver order.
    ///
    /// A driver without a directory for this version and architecture is
    /// left out.
    pub fn resolve_driver_paths(&self, windows_version: &str) -> Result<Vec<PathBuf>> {
        let tag = driver_version_tag(windows_version)?;
        let drivers = self.drivers_dir();
        Ok(self
            .drivers
            .iter()
            .map(|name| drivers.join(name).join(tag).join(DRIVER_ARCH))
            .filter(|path| path.is_dir())
            .collect())
    }
}

/// Exclusive hold on a driver cache; released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Copy `driver_names` and `payload_names` out of `image` into `cache_dir`.
///
/// Existing `drivers/` and `oem/` contents are discarded first.
pub fn extract_drivers<S: AsRef<str>>(
    extractor: &Extractor,
    image: &Path,
    cache_dir: &Path,
    driver_names: &[S],
    payload_names: &[S],
) -> Result<()> {
    info!(image = %image.display(), cache = %cache_dir.display(), "extracting drivers");
    let extracted = extractor.extract(image, &cache_dir.join("extract"))?;
    let contents = extracted.path();

    let drivers = cache_dir.join("drivers");
    replace_dir(&drivers)?;
    for name in driver_names {
        let name = name.as_ref();
        debug!(driver = name, "caching driver");
        copy_into(&contents.join(name), &drivers)
            .with_context(|| format!("copying driver '{}' from {}", name, image.display()))?;
    }

    let oem = cache_dir.join("oem");
    replace_dir(&oem)?;
    for name in payload_names {
        let name = name.as_ref();
        debug!(payload = name, "caching payload");
        copy_into(&contents.join(name), &oem)
            .with_context(|| format!("copying payload '{}' from {}", name, image.display()))?;
    }

    extracted.finish()
}

/// Config plugin contributing cached drivers and guest payloads.
///
/// Installs every cached payload, the optional SPICE agent and WinFsp
/// installers when present among the assets, then offers the resolved
/// driver directories to Windows Setup.
#[derive(Debug, Clone)]
pub struct VirtioDrivers {
    pub cache: DriverCache,
    pub assets: AssetDirs,
}

impl ConfigPlugin for VirtioDrivers {
    fn name(&self) -> &str {
        "qemu_windows_config"
    }

    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()> {
        for payload in self.cache.payload_paths() {
            install_msi(config, &payload, MsiInstall::default())?;
        }
        if let Some(agent) = self.assets.find_installer(SPICE_AGENT_GLOB)? {
            install_msi(config, &agent, MsiInstall::default())?;
        }
        if let Some(winfsp) = self.assets.find_installer(WINFSP_GLOB)? {
            install_msi(config, &winfsp, MsiInstall::default())?;
            config
                .firstlogon_powershell
                .push("Set-Service VirtioFsSvc -StartupType Automatic -Status Running".into());
        }
        let driver_dirs = self.cache.resolve_driver_paths(&config.windows_version)?;
        config.driver_files.extend(driver_dirs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::extract::tests::{fake_7z, fake_tool};
    use crate::artifact::extract::ExtractStrategy;
    use std::fs;
    use tempfile::TempDir;

    /// Lay out a directory that looks like the inside of a virtio-win image.
    fn virtio_contents(dir: &Path) -> PathBuf {
        let root = dir.join("virtio-contents");
        for driver in ["vioscsi", "NetKVM"] {
            let d = root.join(driver).join("w11/amd64");
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join(format!("{}.inf", driver.to_lowercase())), "[Version]").unwrap();
        }
        // qxl only ships for older versions; qxldod only for w10.
        fs::create_dir_all(root.join("qxl/w10/amd64")).unwrap();
        fs::create_dir_all(root.join("qxldod/w10/amd64")).unwrap();
        fs::create_dir_all(root.join("guest-agent")).unwrap();
        fs::write(root.join("virtio-win-gt-x64.msi"), "msi").unwrap();
        fs::write(root.join("guest-agent/qemu-ga-x86_64.msi"), "msi").unwrap();
        root
    }

    fn populated_cache(temp: &Path) -> DriverCache {
        let contents = virtio_contents(temp);
        let program = fake_7z(&temp.join("tools"), &contents);
        let image = temp.join("virtio-win-0.1.262.iso");
        fs::write(&image, "iso").unwrap();

        let cache = DriverCache::new(temp.join("cache"));
        cache
            .populate(&Extractor::new(ExtractStrategy::Unpack { program }), &image)
            .unwrap();
        cache
    }

    #[test]
    fn test_version_tag_table() {
        assert_eq!(driver_version_tag("w11").unwrap(), "w11");
        for unknown in ["w10", "2k22", "W11", ""] {
            let err = driver_version_tag(unknown).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::UnsupportedVersion(v)) if v == unknown
            ));
        }
    }

    #[test]
    fn test_populate_copies_drivers_and_payloads() {
        let temp = TempDir::new().unwrap();
        let cache = populated_cache(temp.path());

        assert!(cache.drivers_dir().join("vioscsi/w11/amd64/vioscsi.inf").is_file());
        assert!(cache.drivers_dir().join("qxl/w10/amd64").is_dir());
        assert!(cache.oem_dir().join("virtio-win-gt-x64.msi").is_file());
        assert!(cache.oem_dir().join("qemu-ga-x86_64.msi").is_file());
        assert!(!cache.extract_dir().exists());
    }

    #[test]
    fn test_populate_discards_previous_contents() {
        let temp = TempDir::new().unwrap();
        let stale = temp.path().join("cache/drivers/oldriver");
        fs::create_dir_all(&stale).unwrap();
        fs::create_dir_all(temp.path().join("cache/oem")).unwrap();
        fs::write(temp.path().join("cache/oem/old.msi"), "").unwrap();

        let cache = populated_cache(temp.path());
        assert!(!stale.exists());
        assert!(!cache.oem_dir().join("old.msi").exists());
    }

    #[test]
    fn test_missing_driver_fails_and_releases_extraction() {
        let temp = TempDir::new().unwrap();
        let contents = virtio_contents(temp.path());
        let program = fake_7z(&temp.path().join("tools"), &contents);
        let image = temp.path().join("virtio-win.iso");
        fs::write(&image, "iso").unwrap();
        let cache = DriverCache::with_sets(temp.path().join("cache"), &["viofs"], &[]);

        let result = cache.populate(&Extractor::new(ExtractStrategy::Unpack { program }), &image);
        assert!(result.is_err());
        assert!(!cache.extract_dir().exists());
    }

    #[test]
    fn test_extraction_failure_propagates() {
        let temp = TempDir::new().unwrap();
        let program = fake_tool(temp.path(), "7z", "exit 2");
        let image = temp.path().join("virtio-win.iso");
        fs::write(&image, "iso").unwrap();

        let err = DriverCache::new(temp.path().join("cache"))
            .populate(&Extractor::new(ExtractStrategy::Unpack { program }), &image)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Extraction { .. })
        ));
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let temp = TempDir::new().unwrap();
        let cache = DriverCache::new(temp.path().join("cache"));

        let held = cache.lock().unwrap();
        assert!(cache.lock().is_err());
        drop(held);
        assert!(cache.lock().is_ok());
    }

    #[test]
    fn test_resolve_only_existing_paths() {
        let temp = TempDir::new().unwrap();
        let cache = populated_cache(temp.path());

        let paths = cache.resolve_driver_paths("w11").unwrap();
        assert_eq!(
            paths,
            vec![
                cache.drivers_dir().join("vioscsi/w11/amd64"),
                cache.drivers_dir().join("NetKVM/w11/amd64"),
            ]
        );
        assert!(paths.iter().all(|p| p.is_dir()));

        assert!(cache.resolve_driver_paths("w10").is_err());
    }

    #[test]
    fn test_plugin_installs_payloads_and_drivers() {
        let temp = TempDir::new().unwrap();
        let cache = populated_cache(temp.path());
        let resource_dir = temp.path().join("resources");
        fs::create_dir_all(resource_dir.join("assets")).unwrap();
        fs::write(resource_dir.join("assets/winfsp-2.0.23075.msi"), "").unwrap();

        let plugin = VirtioDrivers {
            cache: cache.clone(),
            assets: AssetDirs {
                configured: None,
                resource_dir,
            },
        };
        let mut config = WindowsSetupConfig::new("w11");
        plugin.apply(&mut config).unwrap();

        let names: Vec<_> = config
            .oem_files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["virtio-win-gt-x64.msi", "qemu-ga-x86_64.msi", "winfsp-2.0.23075.msi"]
        );
        // Two scriptlets per MSI, plus the virtio-fs service line.
        assert_eq!(config.firstlogon_powershell.len(), 7);
        assert_eq!(
            config.firstlogon_powershell.last().unwrap(),
            "Set-Service VirtioFsSvc -StartupType Automatic -Status Running"
        );
        assert_eq!(config.driver_files.len(), 2);
    }

    #[test]
    fn test_plugin_starts_installers_without_waiting() {
        let temp = TempDir::new().unwrap();
        let plugin = VirtioDrivers {
            cache: populated_cache(temp.path()),
            assets: AssetDirs {
                configured: None,
                resource_dir: temp.path().join("resources"),
            },
        };
        let mut config = WindowsSetupConfig::new("w11");
        plugin.apply(&mut config).unwrap();

        assert_eq!(
            config.firstlogon_powershell[..2],
            [
                r#"echo "Installing c:\windows\setup\virtio-win-gt-x64.msi""#,
                r"Start-Process msiexec.exe -ArgumentList '/i c:\windows\setup\virtio-win-gt-x64.msi /qn /norestart /l*v c:\windows\setup\virtio-win-gt-x64.msi.log'",
            ]
        );
        assert!(config
            .firstlogon_powershell
            .iter()
            .all(|line| !line.contains("-Wait")));
    }

    #[test]
    fn test_plugin_rejects_unknown_version() {
        let temp = TempDir::new().unwrap();
        let plugin = VirtioDrivers {
            cache: DriverCache::new(temp.path().join("cache")),
            assets: AssetDirs {
                configured: None,
                resource_dir: temp.path().to_path_buf(),
            },
        };
        let mut config = WindowsSetupConfig::new("2k22");
        assert!(plugin.apply(&mut config).is_err());
    }
}
