//! Build unattended Windows installation media and base VM images.
//!
//! Starting from a vendor Windows ISO and the virtio driver ISO, this crate
//! produces the two images a VM needs to install Windows with no one at
//! the keyboard:
//!
//! - **Install image** - the vendor ISO repacked with the no-prompt EFI
//!   boot image
//! - **Autounattend image** - answer file, paravirtual drivers, and
//!   first-logon payloads contributed by config plugins
//!
//! Each image is rebuilt only when one of its inputs is newer than it.
//!
//! # Architecture
//!
//! ```text
//! build (orchestration)
//!     │
//!     ├── freshness      skip/build decision from modification times
//!     ├── artifact       extract images (7z or loop mount), compose ISOs
//!     ├── setup          WindowsSetupConfig + ordered ConfigPlugins
//!     ├── drivers        virtio driver/payload cache, as a ConfigPlugin
//!     └── assets         glob lookups with exactly-one semantics
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use winiso_builder::build::{Settings, WindowsBuild};
//!
//! let settings = Settings::load("winiso-builder.toml".as_ref())?;
//! let build = WindowsBuild::new(settings);
//! let (install, autounattend) = build.build_all(false)?;
//! println!("{} {}", install.path().display(), autounattend.path().display());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod artifact;
pub mod assets;
pub mod build;
pub mod drivers;
pub mod error;
pub mod freshness;
pub mod preflight;
pub mod process;
pub mod setup;

// Re-exports for convenience
pub use artifact::extract::{ExtractStrategy, ExtractedImage, Extractor};
pub use artifact::iso::{IsoComposer, IsoOptions, IsoTool, StagingArea};
pub use assets::{find_exactly_one, find_optional};
pub use build::{BuildOutcome, Settings, WindowsBuild};
pub use drivers::{DriverCache, VirtioDrivers};
pub use error::Error;
pub use freshness::{is_stale, Freshness};
pub use process::Cmd;
pub use setup::{ConfigPlugin, PluginRegistry, WindowsSetupConfig};
