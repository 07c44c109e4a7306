//! VM disk descriptors for the built images.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One disk attached to a VM definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub path: PathBuf,
    /// Always `file`: every image is a plain file on the host.
    pub source_type: String,
    /// Image format; ISOs are `raw`.
    pub driver: String,
    /// `cdrom` or `disk`.
    pub target_type: String,
    pub bus: String,
}

impl DiskDescriptor {
    /// Read-only ISO attached as a SATA CD-ROM.
    pub fn cdrom(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source_type: "file".to_string(),
            driver: "raw".to_string(),
            target_type: "cdrom".to_string(),
            bus: "sata".to_string(),
        }
    }
}

/// Disks a base-image VM boots the installer from: the repacked install
/// image first, then the autounattend image.
pub fn base_image_disks(install_image: &Path, autounattend_image: &Path) -> Vec<DiskDescriptor> {
    vec![
        DiskDescriptor::cdrom(install_image),
        DiskDescriptor::cdrom(autounattend_image),
    ]
}

pub fn to_json(disks: &[DiskDescriptor]) -> Result<String> {
    serde_json::to_string_pretty(disks).context("serializing disk descriptors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_image_disks_are_sata_cdroms() {
        let disks = base_image_disks(
            Path::new("/images/Win11_x64_noprompt.iso"),
            Path::new("/state/autounattend_cd/autounattend.iso"),
        );
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].path, PathBuf::from("/images/Win11_x64_noprompt.iso"));
        for disk in &disks {
            assert_eq!(disk.source_type, "file");
            assert_eq!(disk.driver, "raw");
            assert_eq!(disk.target_type, "cdrom");
            assert_eq!(disk.bus, "sata");
        }
    }

    #[test]
    fn test_json_field_names() {
        let json = to_json(&[DiskDescriptor::cdrom("/a.iso")]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["path"], "/a.iso");
        assert_eq!(value[0]["source_type"], "file");
        assert_eq!(value[0]["target_type"], "cdrom");
        assert_eq!(value[0]["bus"], "sata");
    }
}
