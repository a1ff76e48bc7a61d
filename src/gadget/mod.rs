//! USB mass-storage gadget
//!
//! Presents disk images to the car as a USB flash drive via the Linux
//! gadget subsystem. The coordinator depends only on the
//! `MassStorageGadget` trait; the exclusion window in COORDINATOR.md §4
//! needs exactly `enable`/`disable`/`is_enabled`.
//!
//! `is_enabled` must report ground truth read back from the kernel, not a
//! cached flag: some kernels accept the UDC unbind write and leave the
//! gadget bound, and trusting the call's return value would let a
//! read-write host mount corrupt the live FAT filesystem.

mod configfs;

pub use configfs::UsbGadget;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// Gadget operation error
#[derive(Debug, Error)]
pub enum GadgetError {
    /// Gadget structure missing where one is required
    #[error("gadget is not initialized")]
    NotInitialized,

    /// No USB device controller available to bind
    #[error("no USB device controller found under {0}")]
    NoController(PathBuf),

    /// configfs prerequisite missing
    #[error("configfs unavailable: {0}")]
    ConfigfsUnavailable(String),

    /// Underlying filesystem failure
    #[error("gadget I/O at {path}: {source}")]
    Io {
        /// configfs path involved
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },
}

/// Result type for gadget operations
pub type GadgetResult<T> = Result<T, GadgetError>;

/// Configuration for one logical unit
#[derive(Debug, Clone)]
pub struct LunConfig {
    /// Disk image backing the LUN
    pub disk_path: PathBuf,
    /// Present as removable media (the car expects this)
    pub removable: bool,
    /// Expose read-only
    pub readonly: bool,
    /// Emulate a CD-ROM drive
    pub cdrom: bool,
}

impl LunConfig {
    /// A removable read-write disk LUN for `disk_path`
    pub fn disk(disk_path: PathBuf) -> Self {
        LunConfig {
            disk_path,
            removable: true,
            readonly: false,
            cdrom: false,
        }
    }
}

/// Map of LUN number to configuration; LUN 0 is the camera disk
pub type LunMap = BTreeMap<u8, LunConfig>;

/// Abstract mass-storage gadget
pub trait MassStorageGadget: Send + Sync {
    /// Create the gadget structure for the given LUNs
    fn initialize(&self, luns: &LunMap) -> GadgetResult<()>;

    /// Bind to a USB device controller; the car sees the drive appear
    fn enable(&self) -> GadgetResult<()>;

    /// Unbind from the controller; the drive disappears
    fn disable(&self) -> GadgetResult<()>;

    /// Whether the gadget is currently bound, read back from the kernel
    fn is_enabled(&self) -> bool;

    /// Tear the gadget structure down (disables first)
    fn remove(&self) -> GadgetResult<()>;
}
