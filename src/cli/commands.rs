//! CLI command implementations
//!
//! Thin wiring only: load configuration, assemble subsystems, hand
//! control to the coordinator. No archive logic lives here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::archive::{ArchiveBackend, ArchiveDriver, NullBackend, RcloneBackend};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorSettings, ShutdownFlag};
use crate::fsys::{Filesystem, RealFilesystem};
use crate::gadget::{LunConfig, LunMap, MassStorageGadget, UsbGadget};
use crate::idle::{IdleDetector, ProcWriteCounter};
use crate::mount::LoopMounter;
use crate::observability::Logger;
use crate::snapshot::SnapshotStore;
use crate::space::{cam_size_for_backing, SpaceManager};

use super::args::Command;
use super::errors::CliResult;

/// Name of the kernel mass-storage helper the idle detector watches
const MASS_STORAGE_PROCESS: &str = "file-storage";

/// rclone copy timeout
const COPY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Dispatch a parsed command
pub fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Run { config } => run(config),
        Command::Status { config } => status(config),
        Command::Space { config } => space(config),
    }
}

fn load_config(path: Option<PathBuf>) -> CliResult<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(&path)?,
        None => Config::load_from_env()?,
    };
    for warning in config.validate() {
        Logger::warn("CONFIG_WARNING", &[("detail", &warning)]);
    }
    Ok(config)
}

fn build_backend(config: &Config, shutdown: ShutdownFlag) -> Arc<dyn ArchiveBackend> {
    match config.archive.system.as_str() {
        "rclone" => Arc::new(RcloneBackend::new(
            config.archive.rclone_remote.clone(),
            config.archive.rclone_path.clone(),
            config.archive.rclone_flags.clone(),
            COPY_TIMEOUT,
            shutdown,
        )),
        "none" => Arc::new(NullBackend),
        other => {
            Logger::warn("UNKNOWN_ARCHIVE_SYSTEM", &[("system", other)]);
            Arc::new(NullBackend)
        }
    }
}

fn build_coordinator(config: &Config, shutdown: ShutdownFlag) -> CliResult<Coordinator> {
    let fs: Arc<dyn Filesystem> = Arc::new(RealFilesystem::new());
    let store = SnapshotStore::open(
        fs.clone(),
        config.live_image_path(),
        config.snapshots_path(),
    )?;
    let backend = build_backend(config, shutdown.clone());
    let driver = ArchiveDriver::new(fs.clone(), backend.clone(), config.archive_toggles());
    let space = SpaceManager::new(fs.clone(), config.backingfiles_path.clone());

    let settings = CoordinatorSettings {
        poll_base: config.poll_base,
        poll_max: config.poll_max,
        idle_timeout: config.idle_timeout,
        live_image: Some(config.live_image_path()),
        ..CoordinatorSettings::default()
    };

    Ok(Coordinator::new(
        fs,
        store,
        driver,
        space,
        backend,
        Arc::new(LoopMounter::new()),
        settings,
        shutdown,
    ))
}

/// `dashvault run`
pub fn run(config_path: Option<PathBuf>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let shutdown = ShutdownFlag::new();

    let idle = IdleDetector::new(
        Box::new(ProcWriteCounter::new(MASS_STORAGE_PROCESS)),
        shutdown.clone(),
    );

    // Present the live image to the car. Failures are warnings: on a
    // bench machine there is no UDC, and archiving still works.
    let gadget = Arc::new(UsbGadget::new("dashvault"));
    let mut luns = LunMap::new();
    luns.insert(0, LunConfig::disk(config.live_image_path()));
    if let Err(e) = gadget.initialize(&luns).and_then(|_| gadget.enable()) {
        Logger::warn("GADGET_UNAVAILABLE", &[("error", &e.to_string())]);
    }

    let coordinator = build_coordinator(&config, shutdown.clone())?
        .with_gadget(gadget)
        .with_idle_detector(idle);

    shutdown.install_signal_handlers()?;
    coordinator.run();
    // The gadget stays bound on exit; the car keeps recording while the
    // daemon is down.
    Ok(())
}

/// `dashvault status`
pub fn status(config_path: Option<PathBuf>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let coordinator = build_coordinator(&config, ShutdownFlag::new())?;

    println!("{}", serde_json::to_string_pretty(&coordinator.status())?);
    Ok(())
}

/// `dashvault space`
pub fn space(config_path: Option<PathBuf>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let fs: Arc<dyn Filesystem> = Arc::new(RealFilesystem::new());
    let space = SpaceManager::new(fs, config.backingfiles_path.clone());

    let info = space.space_info()?;
    let cam_size = config
        .cam_size
        .unwrap_or_else(|| cam_size_for_backing(info.total_bytes));

    let report = serde_json::json!({
        "space": info,
        "cam_size_bytes": cam_size,
        "cam_size_source": if config.cam_size.is_some() { "configured" } else { "derived" },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
