//! Disk image extraction.
//!
//! [`Extractor::extract`] materializes the files of an ISO in a directory
//! and returns an [`ExtractedImage`] guard. The guard owns that directory:
//! dropping it deletes the unpacked tree or unmounts the image, on every
//! exit path including early `?` returns and panics unwinding through the
//! caller.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::filesystem::replace_dir;
use crate::error::Error;
use crate::process::Cmd;

/// How an image's contents are made available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractStrategy {
    /// Unpack with a 7z-compatible program into the output directory.
    Unpack { program: PathBuf },
    /// Loop-mount the image read-only on the output directory.
    LoopMount { mount: PathBuf, umount: PathBuf },
}

impl ExtractStrategy {
    /// Prefer unpacking when `7z` is installed, else loop mount.
    pub fn detect() -> Self {
        match which::which("7z") {
            Ok(program) => ExtractStrategy::Unpack { program },
            Err(_) => ExtractStrategy::loop_mount(),
        }
    }

    /// Loop mount with the host's `mount` and `umount`.
    pub fn loop_mount() -> Self {
        let locate = |tool: &str| which::which(tool).unwrap_or_else(|_| PathBuf::from(tool));
        ExtractStrategy::LoopMount {
            mount: locate("mount"),
            umount: locate("umount"),
        }
    }
}

/// Extracts disk images with a fixed strategy.
#[derive(Debug, Clone)]
pub struct Extractor {
    strategy: ExtractStrategy,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractStrategy::detect())
    }
}

impl Extractor {
    pub fn new(strategy: ExtractStrategy) -> Self {
        Self { strategy }
    }

    /// Make the contents of `image` available under `out_dir`.
    ///
    /// `out_dir` is owned by the returned guard. Unpacking starts from an
    /// empty `out_dir`, discarding leftovers of an interrupted run; a loop
    /// mount refuses a non-empty mount point. On failure the partially
    /// populated directory is cleaned up before the error is returned.
    pub fn extract(&self, image: &Path, out_dir: &Path) -> Result<ExtractedImage> {
        if !image.is_file() {
            return Err(Error::Extraction {
                image: image.to_path_buf(),
                reason: "source image does not exist".into(),
            }
            .into());
        }

        match &self.strategy {
            ExtractStrategy::Unpack { .. } => replace_dir(out_dir)?,
            ExtractStrategy::LoopMount { .. } => {
                fs::create_dir_all(out_dir).with_context(|| {
                    format!("creating mount point {}", out_dir.display())
                })?;
                let occupied = fs::read_dir(out_dir)
                    .with_context(|| format!("reading mount point {}", out_dir.display()))?
                    .next()
                    .is_some();
                if occupied {
                    return Err(Error::Extraction {
                        image: image.to_path_buf(),
                        reason: format!("mount point {} is not empty", out_dir.display()),
                    }
                    .into());
                }
            }
        }

        // Armed before the tool runs so a failed unpack still removes what it wrote.
        let mut guard = ExtractedImage {
            dir: out_dir.to_path_buf(),
            cleanup: match &self.strategy {
                ExtractStrategy::Unpack { .. } => Cleanup::Remove,
                ExtractStrategy::LoopMount { .. } => Cleanup::RemoveEmpty,
            },
        };

        info!(image = %image.display(), dir = %out_dir.display(), "extracting image");
        let result = match &self.strategy {
            ExtractStrategy::Unpack { program } => Cmd::new(program)
                .arg("x")
                .arg(format!("-o{}", out_dir.display()))
                .arg("-y")
                .arg("--")
                .arg_path(image)
                .error_msg("7z failed to unpack image")
                .run(),
            ExtractStrategy::LoopMount { mount, .. } => Cmd::new(mount)
                .args(["-o", "loop,ro"])
                .arg_path(image)
                .arg_path(out_dir)
                .error_msg("loop mount failed")
                .run(),
        };

        match result {
            Ok(_) => {
                if let ExtractStrategy::LoopMount { umount, .. } = &self.strategy {
                    guard.cleanup = Cleanup::Unmount(umount.clone());
                }
                Ok(guard)
            }
            Err(e) => Err(Error::Extraction {
                image: image.to_path_buf(),
                reason: format!("{:#}", e),
            }
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cleanup {
    /// Unpacked tree: delete it.
    Remove,
    /// Mounted image: unmount with this program, then drop the empty mount point.
    Unmount(PathBuf),
    /// Mount never happened: drop the mount point if still empty.
    RemoveEmpty,
    Done,
}

/// Extracted image contents, released on drop.
#[derive(Debug)]
#[must_use = "dropping the guard immediately removes the extracted contents"]
pub struct ExtractedImage {
    dir: PathBuf,
    cleanup: Cleanup,
}

impl ExtractedImage {
    /// Directory holding the image's files.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Release the contents now, reporting cleanup failures.
    pub fn finish(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let cleanup = std::mem::replace(&mut self.cleanup, Cleanup::Done);
        debug!(dir = %self.dir.display(), ?cleanup, "releasing extracted image");
        match cleanup {
            Cleanup::Remove => match fs::remove_dir_all(&self.dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e)
                    .with_context(|| format!("removing extracted tree {}", self.dir.display())),
                _ => Ok(()),
            },
            Cleanup::Unmount(umount) => {
                Cmd::new(umount)
                    .arg_path(&self.dir)
                    .error_msg(format!("unmounting {}", self.dir.display()))
                    .run()?;
                let _ = fs::remove_dir(&self.dir);
                Ok(())
            }
            Cleanup::RemoveEmpty => {
                let _ = fs::remove_dir(&self.dir);
                Ok(())
            }
            Cleanup::Done => Ok(()),
        }
    }
}

impl Drop for ExtractedImage {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("cleanup of {} failed: {:#}", self.dir.display(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for a host tool.
    pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A 7z stand-in that "unpacks" any image by copying `contents`.
    /// Invoked as: 7z x -o<dir> -y -- <image>
    pub(crate) fn fake_7z(tools: &Path, contents: &Path) -> PathBuf {
        fake_tool(
            tools,
            "7z",
            &format!(r#"out="${{2#-o}}"; cp -R "{}"/. "$out"/"#, contents.display()),
        )
    }

    /// A directory standing in for the files inside a Windows ISO.
    pub(crate) fn fake_image_contents(dir: &Path) -> PathBuf {
        let contents = dir.join("image-contents");
        fs::create_dir_all(contents.join("boot")).unwrap();
        fs::create_dir_all(contents.join("efi/microsoft/boot")).unwrap();
        fs::create_dir_all(contents.join("sources")).unwrap();
        fs::write(contents.join("boot/etfsboot.com"), "bios").unwrap();
        fs::write(contents.join("efi/microsoft/boot/efisys_noprompt.bin"), "efi").unwrap();
        fs::write(contents.join("setup.exe"), "setup").unwrap();
        contents
    }

    /// mount/umount stand-ins. `mount -o loop,ro <image> <dir>` copies
    /// `contents` onto the mount point; `umount <dir>` empties it. Both
    /// append a line to `<tools>/mount.log`.
    fn fake_loop_mount(tools: &Path, contents: &Path) -> ExtractStrategy {
        let log = tools.join("mount.log");
        let mount = fake_tool(
            tools,
            "mount",
            &format!(
                r#"cp -R "{}"/. "$4"/; echo "mount $4" >> "{}""#,
                contents.display(),
                log.display()
            ),
        );
        let umount = fake_tool(
            tools,
            "umount",
            &format!(
                r#"find "$1" -mindepth 1 -delete; echo "umount $1" >> "{}""#,
                log.display()
            ),
        );
        ExtractStrategy::LoopMount { mount, umount }
    }

    fn mount_log(tools: &Path) -> Vec<String> {
        fs::read_to_string(tools.join("mount.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn mounter(temp: &Path) -> (Extractor, PathBuf, PathBuf) {
        let contents = fake_image_contents(temp);
        let tools = temp.join("tools");
        let image = temp.join("Win11_x64.iso");
        fs::write(&image, "iso").unwrap();
        (
            Extractor::new(fake_loop_mount(&tools, &contents)),
            image,
            tools,
        )
    }

    fn unpacker(temp: &Path) -> (Extractor, PathBuf) {
        let contents = fake_image_contents(temp);
        let program = fake_7z(&temp.join("tools"), &contents);
        let image = temp.join("Win11_x64.iso");
        fs::write(&image, "iso").unwrap();
        (Extractor::new(ExtractStrategy::Unpack { program }), image)
    }

    #[test]
    fn test_unpack_yields_contents_and_cleans_up_on_drop() {
        let temp = TempDir::new().unwrap();
        let (extractor, image) = unpacker(temp.path());
        let out = temp.path().join("stamp/extract");

        let extracted = extractor.extract(&image, &out).unwrap();
        assert_eq!(extracted.path(), out);
        assert!(out.join("setup.exe").is_file());
        assert!(out.join("boot/etfsboot.com").is_file());
        assert!(out.join("sources").is_dir());

        drop(extracted);
        assert!(!out.exists());
    }

    #[test]
    fn test_finish_removes_tree() {
        let temp = TempDir::new().unwrap();
        let (extractor, image) = unpacker(temp.path());
        let out = temp.path().join("extract");

        extractor.extract(&image, &out).unwrap().finish().unwrap();
        assert!(!out.exists());
    }

    #[test]
    fn test_tool_failure_is_extraction_error_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("corrupt.iso");
        fs::write(&image, "not an iso").unwrap();
        let program = fake_tool(
            temp.path(),
            "7z",
            r#"out="${2#-o}"; echo partial > "$out/partial"; echo "Can not open the file as archive" >&2; exit 2"#,
        );
        let out = temp.path().join("extract");

        let err = Extractor::new(ExtractStrategy::Unpack { program })
            .extract(&image, &out)
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Extraction { reason, .. }) => {
                assert!(reason.contains("Can not open the file as archive"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_missing_image_is_extraction_error() {
        let temp = TempDir::new().unwrap();
        let err = Extractor::new(ExtractStrategy::loop_mount())
            .extract(&temp.path().join("missing.iso"), &temp.path().join("extract"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Extraction { .. })
        ));
        assert!(!temp.path().join("extract").exists());
    }

    #[test]
    fn test_cleanup_runs_when_caller_body_fails() {
        let temp = TempDir::new().unwrap();
        let (extractor, image) = unpacker(temp.path());
        let out = temp.path().join("extract");

        let body = || -> Result<()> {
            let extracted = extractor.extract(&image, &out)?;
            assert!(extracted.path().join("setup.exe").exists());
            anyhow::bail!("body failed");
        };
        assert!(body().is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_unpack_discards_leftovers_of_interrupted_run() {
        let temp = TempDir::new().unwrap();
        let (extractor, image) = unpacker(temp.path());
        let out = temp.path().join("extract");
        fs::create_dir_all(out.join("sources")).unwrap();
        fs::write(out.join("stale-from-killed-run.txt"), "").unwrap();
        fs::write(out.join("sources/stale.wim"), "").unwrap();

        let extracted = extractor.extract(&image, &out).unwrap();
        assert!(extracted.path().join("setup.exe").is_file());
        assert!(!out.join("stale-from-killed-run.txt").exists());
        assert!(!out.join("sources/stale.wim").exists());
    }

    #[test]
    fn test_loop_mount_unmounts_on_drop() {
        let temp = TempDir::new().unwrap();
        let (extractor, image, tools) = mounter(temp.path());
        let out = temp.path().join("mnt");

        let extracted = extractor.extract(&image, &out).unwrap();
        assert!(out.join("setup.exe").is_file());
        assert!(out.join("boot/etfsboot.com").is_file());

        drop(extracted);
        assert_eq!(
            mount_log(&tools),
            vec![format!("mount {}", out.display()), format!("umount {}", out.display())]
        );
        assert!(!out.exists());
    }

    #[test]
    fn test_loop_mount_finish_unmounts() {
        let temp = TempDir::new().unwrap();
        let (extractor, image, tools) = mounter(temp.path());
        let out = temp.path().join("mnt");

        extractor.extract(&image, &out).unwrap().finish().unwrap();
        assert_eq!(mount_log(&tools).len(), 2);
        assert!(!out.exists());
    }

    #[test]
    fn test_loop_mount_unmounts_when_caller_body_fails() {
        let temp = TempDir::new().unwrap();
        let (extractor, image, tools) = mounter(temp.path());
        let out = temp.path().join("mnt");

        let body = || -> Result<()> {
            let extracted = extractor.extract(&image, &out)?;
            assert!(extracted.path().join("setup.exe").exists());
            anyhow::bail!("body failed");
        };
        assert!(body().is_err());
        assert_eq!(
            mount_log(&tools).last().unwrap(),
            &format!("umount {}", out.display())
        );
        assert!(!out.exists());
    }

    #[test]
    fn test_loop_mount_refuses_occupied_mount_point() {
        let temp = TempDir::new().unwrap();
        let (extractor, image, tools) = mounter(temp.path());
        let out = temp.path().join("mnt");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale-from-killed-run.txt"), "").unwrap();

        let err = extractor.extract(&image, &out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Extraction { .. })
        ));
        assert!(mount_log(&tools).is_empty());
        assert!(out.join("stale-from-killed-run.txt").exists());
    }

    #[test]
    fn test_failed_mount_removes_empty_mount_point() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("Win11_x64.iso");
        fs::write(&image, "iso").unwrap();
        let strategy = ExtractStrategy::LoopMount {
            mount: fake_tool(temp.path(), "mount", "echo 'failed to setup loop device' >&2; exit 32"),
            umount: fake_tool(temp.path(), "umount", "exit 1"),
        };
        let out = temp.path().join("mnt");

        let err = Extractor::new(strategy).extract(&image, &out).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to setup loop device"));
        assert!(!out.exists());
    }
}
