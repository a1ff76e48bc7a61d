//! configfs-backed gadget implementation
//!
//! Manages `/sys/kernel/config/usb_gadget/<name>`. Requires configfs
//! mounted, the libcomposite module loaded, and a UDC (e.g. dwc2).
//! Teardown runs in reverse creation order; configfs refuses rmdir on
//! populated nodes.

use std::fs;
use std::path::{Path, PathBuf};

use crate::observability::Logger;

use super::{GadgetError, GadgetResult, LunMap, MassStorageGadget};

// Linux Foundation composite gadget ids
const VENDOR_ID: &str = "0x1d6b";
const PRODUCT_ID: &str = "0x0104";

/// USB mass-storage gadget over configfs
pub struct UsbGadget {
    name: String,
    configfs: PathBuf,
    gadget_path: PathBuf,
    udc_path: PathBuf,
}

impl UsbGadget {
    /// Gadget named `name` under the default configfs mount
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_paths(
            name,
            PathBuf::from("/sys/kernel/config/usb_gadget"),
            PathBuf::from("/sys/class/udc"),
        )
    }

    /// Gadget with explicit configfs and UDC class paths (tests)
    pub fn with_paths(name: impl Into<String>, configfs: PathBuf, udc_path: PathBuf) -> Self {
        let name = name.into();
        let gadget_path = configfs.join(&name);
        UsbGadget {
            name,
            configfs,
            gadget_path,
            udc_path,
        }
    }

    fn write(&self, path: &Path, value: &str) -> GadgetResult<()> {
        Logger::trace(
            "GADGET_WRITE",
            &[("path", &path.display().to_string()), ("value", value)],
        );
        fs::write(path, value).map_err(|e| GadgetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn read(&self, path: &Path) -> GadgetResult<String> {
        fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| GadgetError::Io {
                path: path.to_path_buf(),
                source: e,
            })
    }

    fn mkdir(&self, path: &Path) -> GadgetResult<()> {
        fs::create_dir_all(path).map_err(|e| GadgetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn first_udc(&self) -> GadgetResult<String> {
        let mut entries = fs::read_dir(&self.udc_path)
            .map_err(|_| GadgetError::NoController(self.udc_path.clone()))?;
        entries
            .next()
            .and_then(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .ok_or_else(|| GadgetError::NoController(self.udc_path.clone()))
    }

    fn function_path(&self) -> PathBuf {
        self.gadget_path.join("functions").join("mass_storage.0")
    }

    fn config_path(&self) -> PathBuf {
        self.gadget_path.join("configs").join("c.1")
    }

    fn udc_file(&self) -> PathBuf {
        self.gadget_path.join("UDC")
    }

    /// Whether the gadget structure exists in configfs
    pub fn is_initialized(&self) -> bool {
        self.gadget_path.exists()
    }
}

impl MassStorageGadget for UsbGadget {
    fn initialize(&self, luns: &LunMap) -> GadgetResult<()> {
        if self.is_initialized() {
            Logger::info("GADGET_ALREADY_INITIALIZED", &[("name", &self.name)]);
            return Ok(());
        }
        if luns.is_empty() {
            return Err(GadgetError::ConfigfsUnavailable(
                "at least one LUN must be configured".to_string(),
            ));
        }
        if !self.configfs.exists() {
            return Err(GadgetError::ConfigfsUnavailable(format!(
                "{} missing; mount configfs and modprobe libcomposite",
                self.configfs.display()
            )));
        }

        Logger::info(
            "GADGET_INITIALIZING",
            &[("name", &self.name), ("luns", &luns.len().to_string())],
        );

        let result = (|| -> GadgetResult<()> {
            self.mkdir(&self.gadget_path)?;
            self.write(&self.gadget_path.join("idVendor"), VENDOR_ID)?;
            self.write(&self.gadget_path.join("idProduct"), PRODUCT_ID)?;
            self.write(&self.gadget_path.join("bcdDevice"), "0x0100")?;
            self.write(&self.gadget_path.join("bcdUSB"), "0x0200")?;

            let strings = self.gadget_path.join("strings").join("0x409");
            self.mkdir(&strings)?;
            self.write(&strings.join("manufacturer"), "dashvault")?;
            self.write(&strings.join("product"), "Dashcam Drive")?;
            self.write(&strings.join("serialnumber"), "fedcba9876543210")?;

            let func = self.function_path();
            self.mkdir(&func)?;
            for (lun_id, lun) in luns {
                let lun_dir = func.join(format!("lun.{}", lun_id));
                // configfs pre-creates lun.0; create_dir_all tolerates it
                self.mkdir(&lun_dir)?;
                self.write(&lun_dir.join("removable"), if lun.removable { "1" } else { "0" })?;
                self.write(&lun_dir.join("ro"), if lun.readonly { "1" } else { "0" })?;
                self.write(&lun_dir.join("cdrom"), if lun.cdrom { "1" } else { "0" })?;
                self.write(&lun_dir.join("file"), &lun.disk_path.display().to_string())?;
            }

            let cfg = self.config_path();
            self.mkdir(&cfg)?;
            let cfg_strings = cfg.join("strings").join("0x409");
            self.mkdir(&cfg_strings)?;
            self.write(&cfg_strings.join("configuration"), "Config 1: Mass Storage")?;
            self.write(&cfg.join("MaxPower"), "250")?;

            let link = cfg.join("mass_storage.0");
            if !link.exists() {
                #[cfg(unix)]
                std::os::unix::fs::symlink(&func, &link).map_err(|e| GadgetError::Io {
                    path: link.clone(),
                    source: e,
                })?;
            }
            Ok(())
        })();

        if result.is_err() {
            // Best-effort cleanup of the partial structure
            let _ = fs::remove_dir_all(&self.gadget_path);
        }
        result
    }

    fn enable(&self) -> GadgetResult<()> {
        if !self.is_initialized() {
            return Err(GadgetError::NotInitialized);
        }
        if self.is_enabled() {
            return Ok(());
        }
        let udc = self.first_udc()?;
        Logger::info("GADGET_ENABLING", &[("name", &self.name), ("udc", &udc)]);
        self.write(&self.udc_file(), &udc)
    }

    fn disable(&self) -> GadgetResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        Logger::info("GADGET_DISABLING", &[("name", &self.name)]);
        self.write(&self.udc_file(), "")
    }

    fn is_enabled(&self) -> bool {
        // Ground truth: a non-empty UDC file means bound
        match self.read(&self.udc_file()) {
            Ok(udc) => !udc.is_empty(),
            Err(_) => false,
        }
    }

    fn remove(&self) -> GadgetResult<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        self.disable()?;

        Logger::info("GADGET_REMOVING", &[("name", &self.name)]);

        let cfg = self.config_path();
        let link = cfg.join("mass_storage.0");
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link).map_err(|e| GadgetError::Io {
                path: link,
                source: e,
            })?;
        }
        for dir in [
            cfg.join("strings").join("0x409"),
            cfg,
            self.function_path(),
            self.gadget_path.join("strings").join("0x409"),
        ] {
            if dir.exists() {
                fs::remove_dir(&dir).map_err(|e| GadgetError::Io {
                    path: dir.clone(),
                    source: e,
                })?;
            }
        }
        fs::remove_dir(&self.gadget_path).map_err(|e| GadgetError::Io {
            path: self.gadget_path.clone(),
            source: e,
        })
    }
}
