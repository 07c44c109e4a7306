//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a build needs before any image is
//! touched, so a missing `xorriso` shows up as one clear message instead of
//! a failure halfway through a repack.
//!
//! # Example
//!
//! ```rust
//! use winiso_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("xorriso") {
//!     println!("xorriso not installed");
//! }
//!
//! let tools = &[("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools always needed to compose images.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("xorriso", "xorriso")];

/// Tools for the loop-mount extraction fallback.
pub const MOUNT_TOOLS: &[(&str, &str)] = &[("mount", "util-linux"), ("umount", "util-linux")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Whether this process may loop-mount images.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Check that at least one extraction strategy can work on this host.
///
/// `7z` is preferred; without it, loop mounting needs mount tools and root.
pub fn check_extraction_strategy() -> Result<()> {
    if command_exists("7z") {
        return Ok(());
    }
    check_required_tools(MOUNT_TOOLS)?;
    if !running_as_root() {
        bail!("7z is not installed and loop-mounting images requires root (install: p7zip)");
    }
    Ok(())
}

/// Check everything a full build needs, using `iso_tool` as the image builder.
pub fn check_host_tools(iso_tool: &str) -> Result<()> {
    let tools: Vec<(&str, &str)> = if iso_tool == "xorriso" {
        REQUIRED_TOOLS.to_vec()
    } else {
        vec![(iso_tool, iso_tool)]
    };
    check_required_tools(&tools)?;
    check_extraction_strategy()
}
