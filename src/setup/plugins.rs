//! Built-in config plugins and the MSI install helper.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::{guest_setup_path, ConfigPlugin, WindowsSetupConfig};
use crate::assets::{find_optional, NVDA_GLOB};

/// Where the administrators' authorized keys live in the guest.
pub const ADMIN_AUTHORIZED_KEYS: &str = r"C:\ProgramData\ssh\administrators_authorized_keys";

/// Name the sysprep answer file is staged under.
pub const SYSPREP_ANSWER_FILE: &str = "sysprep_unattend.xml";

/// How an MSI payload is installed at first logon.
///
/// The default announces the install and starts msiexec without waiting
/// for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiInstall {
    /// Print a status line before installing.
    pub announce: bool,
    /// Wait for msiexec to finish before the next scriptlet.
    pub wait: bool,
}

impl Default for MsiInstall {
    fn default() -> Self {
        Self {
            announce: true,
            wait: false,
        }
    }
}

impl MsiInstall {
    /// Block the first-logon script until msiexec exits.
    pub fn waited() -> Self {
        Self {
            wait: true,
            ..Self::default()
        }
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("payload has no file name: {}", path.display()))
}

/// Stage `msi` as an OEM payload and install it silently at first logon.
///
/// Appends one entry to `oem_files` and, depending on `mode`, one or two
/// first-logon scriptlets. msiexec writes a verbose log next to the
/// payload in the guest.
pub fn install_msi(config: &mut WindowsSetupConfig, msi: &Path, mode: MsiInstall) -> Result<()> {
    let name = file_name_of(msi)?;
    let guest_msi = guest_setup_path(&name);
    let guest_log = guest_setup_path(&format!("{}.log", name));

    config.oem_files.push(msi.to_path_buf());
    if mode.announce {
        config
            .firstlogon_powershell
            .push(format!("echo \"Installing {}\"", guest_msi));
    }
    let wait = if mode.wait { " -Wait" } else { "" };
    config.firstlogon_powershell.push(format!(
        "Start-Process msiexec.exe{} -ArgumentList '/i {} /qn /norestart /l*v {}'",
        wait, guest_msi, guest_log
    ));
    Ok(())
}

/// Installs and starts the OpenSSH server at first logon when `enable_sshd` is set.
///
/// When the image will be generalized the service is only set to start
/// automatically; it is not started in the template.
#[derive(Debug, Default)]
pub struct SshServer;

impl ConfigPlugin for SshServer {
    fn name(&self) -> &str {
        "ssh_server"
    }

    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()> {
        if !config.enable_sshd {
            return Ok(());
        }
        let run_service = if config.generalize { "" } else { " -Status Running" };
        config.firstlogon_powershell.extend([
            "Add-WindowsCapability -online -name OpenSSH.Server~~~~0.0.1.0".to_string(),
            format!("Set-Service sshd -StartupType automatic{}", run_service),
            "get-NetFirewallRule -name *openssh* |set-NetFirewallRule -profile public,private,domain"
                .to_string(),
        ]);
        Ok(())
    }
}

/// Installs an `authorized_keys` file for the administrators group.
#[derive(Debug)]
pub struct AuthorizedKeys {
    pub keys_file: PathBuf,
}

impl ConfigPlugin for AuthorizedKeys {
    fn name(&self) -> &str {
        "authorized_keys"
    }

    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()> {
        if !self.keys_file.is_file() {
            anyhow::bail!("authorized keys file not found: {}", self.keys_file.display());
        }
        let name = file_name_of(&self.keys_file)?;
        config.oem_files.push(self.keys_file.clone());
        config.specialize_powershell.push(format!(
            "New-Item -ItemType Directory -Force -Path C:\\ProgramData\\ssh | Out-Null\n\
             Copy-Item {src} {dst}\n\
             icacls.exe {dst} /inheritance:r /grant Administrators:F /grant SYSTEM:F",
            src = guest_setup_path(&name),
            dst = ADMIN_AUTHORIZED_KEYS,
        ));
        Ok(())
    }
}

/// Keeps Windows from enabling BitLocker device encryption on its own.
#[derive(Debug, Default)]
pub struct DeviceEncryption;

impl ConfigPlugin for DeviceEncryption {
    fn name(&self) -> &str {
        "device_encryption"
    }

    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()> {
        if !config.disable_device_encryption {
            return Ok(());
        }
        config.specialize_powershell.extend([
            r#"New-ItemProperty -Path "HKLM:\SYSTEM\CurrentControlSet\Control\BitLocker" -Name "PreventDeviceEncryption" -Value 1 -PropertyType DWord"#.to_string(),
            r#"New-ItemProperty -Path "HKLM:\SYSTEM\CurrentControlSet\Control\BitLocker" -Name "DisableBDE" -Value 1 -PropertyType DWord"#.to_string(),
        ]);
        Ok(())
    }
}

/// Stages the sysprep answer file and, when generalizing, runs sysprep last.
///
/// Register after every plugin that adds first-logon scriptlets: sysprep
/// shuts the machine down.
#[derive(Debug)]
pub struct Sysprep {
    /// Rendered `sysprep_unattend.xml`.
    pub answer_file: PathBuf,
}

impl ConfigPlugin for Sysprep {
    fn name(&self) -> &str {
        "sysprep"
    }

    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()> {
        config.oem_files.push(self.answer_file.clone());
        if config.generalize {
            config.firstlogon_powershell.push(format!(
                r"c:\windows\system32\sysprep\sysprep /generalize /oobe /shutdown /unattend:{}",
                guest_setup_path(SYSPREP_ANSWER_FILE)
            ));
        }
        Ok(())
    }
}

/// Installs the NVDA screen reader when its installer is among the assets.
#[derive(Debug)]
pub struct ScreenReader {
    pub assets_dir: PathBuf,
}

impl ConfigPlugin for ScreenReader {
    fn name(&self) -> &str {
        "nvda_screenreader_install"
    }

    fn apply(&self, config: &mut WindowsSetupConfig) -> Result<()> {
        let Some(installer) = find_optional(&self.assets_dir, NVDA_GLOB)? else {
            return Ok(());
        };
        let name = file_name_of(&installer)?;
        config.oem_files.push(installer);
        config.firstlogon_powershell.push(format!(
            "{} --install-silent --enable-start-on-logon=true",
            guest_setup_path(&name)
        ));
        Ok(())
    }
}
