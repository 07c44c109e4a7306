//! ISO image composition.
//!
//! Composition is two-phase: [`IsoComposer::begin`] hands out a fresh
//! staging directory, the caller drops whatever files the image needs into
//! it, then [`StagingArea::finish`] runs the image tool over the staging
//! directory plus any extra source trees named in the options.
//!
//! The image is written under a temporary name and moved into place only
//! after the tool succeeds.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

use super::filesystem::atomic_move;
use crate::error::Error;
use crate::process::Cmd;

/// BIOS El Torito boot image inside a Windows install tree.
pub const BIOS_BOOT_IMAGE: &str = "boot/etfsboot.com";

/// UEFI boot image that skips the "press any key" prompt.
pub const UEFI_NOPROMPT_BOOT_IMAGE: &str = "efi/microsoft/boot/efisys_noprompt.bin";

/// The mkisofs-compatible program that builds images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTool {
    pub program: PathBuf,
    /// Arguments placed before everything else (`-as mkisofs` for xorriso).
    pub leading_args: Vec<String>,
}

impl Default for IsoTool {
    fn default() -> Self {
        Self::xorriso()
    }
}

impl IsoTool {
    pub fn xorriso() -> Self {
        Self {
            program: PathBuf::from("xorriso"),
            leading_args: vec!["-as".into(), "mkisofs".into()],
        }
    }

    /// Resolve a configured tool name; `xorriso` gets its mkisofs emulation flags.
    pub fn from_name(name: &str) -> Self {
        if name == "xorriso" {
            Self::xorriso()
        } else {
            Self {
                program: PathBuf::from(name),
                leading_args: Vec::new(),
            }
        }
    }
}

/// Options for building an ISO image, passed to the tool verbatim.
#[derive(Debug, Clone, Default)]
pub struct IsoOptions {
    /// Tool flags, in order.
    pub flags: Vec<OsString>,
    /// Source trees merged into the image root after the flags.
    pub extra_sources: Vec<PathBuf>,
}

impl IsoOptions {
    /// Plain data image: no flags, no extra sources.
    pub fn data() -> Self {
        Self::default()
    }

    /// Bootable Windows install image built from an extracted install tree.
    ///
    /// BIOS boots `boot/etfsboot.com`; UEFI boots the no-prompt EFI image.
    pub fn windows_install(extracted_tree: &Path) -> Self {
        let flags = [
            "-iso-level",
            "4",
            "-disable-deep-relocation",
            "-untranslated-filenames",
            "-b",
            BIOS_BOOT_IMAGE,
            "-no-emul-boot",
            "-boot-load-size",
            "8",
            "-eltorito-alt-boot",
            "-eltorito-platform",
            "efi",
            "-b",
            UEFI_NOPROMPT_BOOT_IMAGE,
        ];
        Self {
            flags: flags.iter().map(OsString::from).collect(),
            extra_sources: vec![extracted_tree.to_path_buf()],
        }
    }
}

/// Builds ISO images with a configured tool.
#[derive(Debug, Clone, Default)]
pub struct IsoComposer {
    tool: IsoTool,
}

impl IsoComposer {
    pub fn new(tool: IsoTool) -> Self {
        Self { tool }
    }

    /// Start composing `output_dir/output_name`.
    ///
    /// The staging directory lives under `output_dir` and is removed when
    /// the returned [`StagingArea`] is finished or dropped.
    pub fn begin(
        &self,
        output_dir: &Path,
        output_name: &str,
        options: IsoOptions,
    ) -> Result<StagingArea> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(output_dir)
            .with_context(|| format!("creating staging directory in {}", output_dir.display()))?;

        Ok(StagingArea {
            staging,
            output: output_dir.join(output_name),
            options,
            tool: self.tool.clone(),
        })
    }

    /// Scoped form of [`begin`](Self::begin): `populate` fills the staging
    /// directory, then the image is built.
    ///
    /// If `populate` fails the image is not built and its error is returned.
    pub fn compose_with<F>(
        &self,
        output_dir: &Path,
        output_name: &str,
        options: IsoOptions,
        populate: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let area = self.begin(output_dir, output_name, options)?;
        populate(area.path())?;
        area.finish()
    }
}

/// A staging directory whose contents become an ISO image on [`finish`](Self::finish).
#[derive(Debug)]
pub struct StagingArea {
    staging: TempDir,
    output: PathBuf,
    options: IsoOptions,
    tool: IsoTool,
}

impl StagingArea {
    /// Directory to populate with files for the image root.
    pub fn path(&self) -> &Path {
        self.staging.path()
    }

    /// Build the image and return its path.
    pub fn finish(self) -> Result<PathBuf> {
        let file_name = self
            .output
            .file_name()
            .with_context(|| format!("output has no file name: {}", self.output.display()))?;
        let mut partial_name = OsString::from(".");
        partial_name.push(file_name);
        partial_name.push(".partial");
        let partial = self.output.with_file_name(partial_name);

        let cmd = Cmd::new(&self.tool.program)
            .args(&self.tool.leading_args)
            .arg("-o")
            .arg_path(&partial)
            .args(&self.options.flags)
            .args(self.options.extra_sources.iter().map(|p| p.as_os_str()))
            .arg_path(self.staging.path())
            .error_msg("ISO build tool failed");

        info!(output = %self.output.display(), "composing image");
        if let Err(e) = cmd.run() {
            let _ = fs::remove_file(&partial);
            return Err(Error::Compose {
                output: self.output.clone(),
                reason: format!("{:#}", e),
            }
            .into());
        }

        atomic_move(&partial, &self.output)?;
        Ok(self.output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::artifact::extract::tests::fake_tool;
    use tempfile::TempDir;

    /// An image tool stand-in. Records its arguments in `<tools>/iso-args.log`
    /// and writes, as the "image", the sorted file list of every absolute
    /// directory argument.
    pub(crate) fn fake_iso_tool(tools: &Path) -> IsoTool {
        let log = tools.join("iso-args.log");
        let program = fake_tool(
            tools,
            "mkisofs",
            &format!(
                r#"out=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
printf '%s\n' "$@" > "{}"
: > "$out"
for a in "$@"; do
  case "$a" in /*) if [ -d "$a" ]; then (cd "$a" && find . -type f | sort) >> "$out"; fi;; esac
done"#,
                log.display()
            ),
        );
        IsoTool {
            program,
            leading_args: Vec::new(),
        }
    }

    pub(crate) fn logged_args(tools: &Path) -> Vec<String> {
        fs::read_to_string(tools.join("iso-args.log"))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_compose_builds_from_staging() {
        let temp = TempDir::new().unwrap();
        let tools = temp.path().join("tools");
        let composer = IsoComposer::new(fake_iso_tool(&tools));
        let out_dir = temp.path().join("out");

        let area = composer
            .begin(&out_dir, "autounattend.iso", IsoOptions::data())
            .unwrap();
        let staging = area.path().to_path_buf();
        assert!(staging.starts_with(&out_dir));
        fs::write(staging.join("autounattend.xml"), "<unattend/>").unwrap();
        let image = area.finish().unwrap();

        assert_eq!(image, out_dir.join("autounattend.iso"));
        let listing = fs::read_to_string(&image).unwrap();
        assert!(listing.contains("./autounattend.xml"));
        assert!(!staging.exists());
        assert!(!out_dir.join(".autounattend.iso.partial").exists());
    }

    #[test]
    fn test_windows_install_flags_and_source_order() {
        let temp = TempDir::new().unwrap();
        let tools = temp.path().join("tools");
        let extracted = temp.path().join("extract");
        fs::create_dir_all(extracted.join("boot")).unwrap();
        fs::write(extracted.join("boot/etfsboot.com"), "bios").unwrap();

        let out_dir = temp.path().join("images");
        let image = IsoComposer::new(fake_iso_tool(&tools))
            .compose_with(
                &out_dir,
                "Win11_x64_noprompt.iso",
                IsoOptions::windows_install(&extracted),
                |_| Ok(()),
            )
            .unwrap();

        let args = logged_args(&tools);
        let expected_flags = [
            "-iso-level",
            "4",
            "-disable-deep-relocation",
            "-untranslated-filenames",
            "-b",
            "boot/etfsboot.com",
            "-no-emul-boot",
            "-boot-load-size",
            "8",
            "-eltorito-alt-boot",
            "-eltorito-platform",
            "efi",
            "-b",
            "efi/microsoft/boot/efisys_noprompt.bin",
        ];
        assert_eq!(args[0], "-o");
        assert_eq!(&args[2..2 + expected_flags.len()], &expected_flags);
        assert_eq!(args[2 + expected_flags.len()], extracted.to_str().unwrap());
        assert_eq!(args.len(), expected_flags.len() + 4);

        assert!(fs::read_to_string(image)
            .unwrap()
            .contains("./boot/etfsboot.com"));
    }

    #[test]
    fn test_tool_failure_is_compose_error() {
        let temp = TempDir::new().unwrap();
        let program = fake_tool(temp.path(), "mkisofs", "echo 'bad boot image' >&2; exit 1");
        let composer = IsoComposer::new(IsoTool {
            program,
            leading_args: Vec::new(),
        });
        let out_dir = temp.path().join("out");

        let err = composer
            .compose_with(&out_dir, "broken.iso", IsoOptions::data(), |_| Ok(()))
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Compose { output, reason }) => {
                assert_eq!(output, &out_dir.join("broken.iso"));
                assert!(reason.contains("bad boot image"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!out_dir.join("broken.iso").exists());
    }

    #[test]
    fn test_populate_error_skips_build() {
        let temp = TempDir::new().unwrap();
        let tools = temp.path().join("tools");
        let out_dir = temp.path().join("out");

        let result = IsoComposer::new(fake_iso_tool(&tools)).compose_with(
            &out_dir,
            "x.iso",
            IsoOptions::data(),
            |_| anyhow::bail!("payload missing"),
        );
        assert!(result.is_err());
        assert!(!tools.join("iso-args.log").exists());
        assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_xorriso_uses_mkisofs_emulation() {
        let tool = IsoTool::from_name("xorriso");
        assert_eq!(tool.leading_args, vec!["-as", "mkisofs"]);
        assert!(IsoTool::from_name("genisoimage").leading_args.is_empty());
    }
}
