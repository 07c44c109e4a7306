use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use winiso_builder::build::settings::DEFAULT_CONFIG_FILE;
use winiso_builder::build::{disk, BuildOutcome, Settings, WindowsBuild};
use winiso_builder::preflight;

#[derive(Parser)]
#[command(
    name = "winiso-builder",
    about = "Build unattended Windows installation media and base VM images"
)]
struct Cli {
    /// Path to config file (default: ./winiso-builder.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rebuild even when outputs are current
    #[arg(short, long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Repack the vendor install image so it boots without a key press
    Repack,
    /// Refill the driver cache from the virtio driver image
    Drivers,
    /// Build the autounattend image
    Autounattend,
    /// Build every image
    All,
    /// Print VM disk descriptors for the built images as JSON
    Disks,
    /// Check host tools
    Preflight,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let settings = Settings::load(&config)?;

    match cli.command {
        Command::Preflight => {
            preflight::check_host_tools(&settings.iso_tool)?;
            println!("[preflight] host tools OK");
            Ok(())
        }
        Command::Disks => {
            let disks = WindowsBuild::new(settings).disks()?;
            println!("{}", disk::to_json(&disks)?);
            Ok(())
        }
        Command::Repack => {
            preflight::check_host_tools(&settings.iso_tool)?;
            let outcome = WindowsBuild::new(settings).install_image().build(cli.force)?;
            report("repack", &outcome);
            Ok(())
        }
        Command::Drivers => {
            preflight::check_extraction_strategy()?;
            let build = WindowsBuild::new(settings);
            let _lock = build.driver_cache().lock()?;
            let cache = build.populate_drivers()?;
            println!("[drivers] cache refreshed at {}", cache.root().display());
            Ok(())
        }
        Command::Autounattend => {
            preflight::check_host_tools(&settings.iso_tool)?;
            let build = WindowsBuild::new(settings);
            let _lock = build.driver_cache().lock()?;
            let outcome = build.autounattend().build(cli.force)?;
            report("autounattend", &outcome);
            Ok(())
        }
        Command::All => {
            preflight::check_host_tools(&settings.iso_tool)?;
            let build = WindowsBuild::new(settings);
            let _lock = build.driver_cache().lock()?;
            let (install, autounattend) = build
                .build_all(cli.force)
                .context("building Windows images")?;
            report("repack", &install);
            report("autounattend", &autounattend);
            Ok(())
        }
    }
}

fn report(step: &str, outcome: &BuildOutcome) {
    match outcome {
        BuildOutcome::AlreadyCurrent { path, .. } => {
            println!("[{step}] up to date: {}", path.display());
        }
        BuildOutcome::Built { path } => {
            println!("[{step}] built {}", path.display());
        }
    }
}
