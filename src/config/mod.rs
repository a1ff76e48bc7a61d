//! Configuration
//!
//! Loaded from the setup-variables file (shell-style `KEY=VALUE`, with
//! comments, `export` prefixes, and quoted values tolerated) or from the
//! process environment. File values never touch the environment.
//!
//! Keys:
//! - `BACKINGFILES_PATH` (default `/backingfiles`)
//! - `ARCHIVE_SYSTEM` (`rclone` or `none`)
//! - `RCLONE_DRIVE`, `RCLONE_PATH`, `RCLONE_FLAGS` (space-separated)
//! - `ARCHIVE_SAVEDCLIPS`, `ARCHIVE_SENTRYCLIPS`, `ARCHIVE_RECENTCLIPS`,
//!   `ARCHIVE_TRACKMODECLIPS`
//! - `CAM_SIZE` (size string; defaults to the SPACE.md formula)
//! - `IDLE_TIMEOUT_SECS`, `POLL_BASE_SECS`, `POLL_MAX_SECS`

mod errors;

pub use errors::{ConfigError, ConfigResult};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use crate::archive::ArchiveToggles;

/// Archive-specific configuration
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Archive system name: `rclone` or `none`
    pub system: String,
    /// rclone remote name (e.g. `gdrive`)
    pub rclone_remote: String,
    /// Path within the remote
    pub rclone_path: String,
    /// Extra rclone flags
    pub rclone_flags: Vec<String>,
    /// Archive TeslaCam/SavedClips
    pub saved: bool,
    /// Archive TeslaCam/SentryClips
    pub sentry: bool,
    /// Archive TeslaCam/RecentClips
    pub recent: bool,
    /// Archive TeslaTrackMode
    pub track: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            system: "none".to_string(),
            rclone_remote: String::new(),
            rclone_path: String::new(),
            rclone_flags: Vec::new(),
            saved: true,
            sentry: true,
            recent: false,
            track: true,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing volume root (holds the live image and snapshots)
    pub backingfiles_path: PathBuf,
    /// Archive settings
    pub archive: ArchiveConfig,
    /// Explicit live-image size; None derives it from the volume
    pub cam_size: Option<u64>,
    /// Idle-wait bound
    pub idle_timeout: Duration,
    /// Reachability/idle backoff base
    pub poll_base: Duration,
    /// Backoff cap
    pub poll_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backingfiles_path: PathBuf::from("/backingfiles"),
            archive: ArchiveConfig::default(),
            cam_size: None,
            idle_timeout: Duration::from_secs(90),
            poll_base: Duration::from_secs(5),
            poll_max: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Path of the live image on the backing volume
    pub fn live_image_path(&self) -> PathBuf {
        self.backingfiles_path.join("cam_disk.bin")
    }

    /// Path of the snapshots root
    pub fn snapshots_path(&self) -> PathBuf {
        self.backingfiles_path.join("snapshots")
    }

    /// Directory toggles for the archive driver
    pub fn archive_toggles(&self) -> ArchiveToggles {
        ArchiveToggles {
            saved: self.archive.saved,
            sentry: self.archive.sentry,
            recent: self.archive.recent,
            track: self.archive.track,
        }
    }

    /// Validation warnings; empty when the configuration is sound
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !matches!(self.archive.system.as_str(), "rclone" | "none") {
            warnings.push(format!("unknown archive system: {}", self.archive.system));
        }
        if self.archive.system == "rclone" && self.archive.rclone_remote.is_empty() {
            warnings.push("ARCHIVE_SYSTEM=rclone but RCLONE_DRIVE is empty".to_string());
        }
        if self.poll_base.is_zero() {
            warnings.push("POLL_BASE_SECS must be positive".to_string());
        }
        if self.poll_max < self.poll_base {
            warnings.push("POLL_MAX_SECS is below POLL_BASE_SECS".to_string());
        }
        if let Some(cam_size) = self.cam_size {
            if cam_size % 512 != 0 {
                warnings.push(format!("CAM_SIZE {} is not sector-aligned", cam_size));
            }
        }

        warnings
    }

    fn from_map(map: &BTreeMap<String, String>) -> ConfigResult<Config> {
        let defaults = Config::default();
        let archive_defaults = ArchiveConfig::default();

        let flag = |key: &str, default: bool| -> bool {
            match map.get(key) {
                // Opt-out keys default true unless explicitly "false";
                // opt-in keys default false unless explicitly "true"
                Some(value) if default => value.to_lowercase() != "false",
                Some(value) => value.to_lowercase() == "true",
                None => default,
            }
        };

        let secs = |key: &str, default: Duration| -> ConfigResult<Duration> {
            match map.get(key) {
                Some(value) => value
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.clone(),
                    }),
                None => Ok(default),
            }
        };

        let archive = ArchiveConfig {
            system: map
                .get("ARCHIVE_SYSTEM")
                .map(|s| s.to_lowercase())
                .unwrap_or(archive_defaults.system),
            rclone_remote: map.get("RCLONE_DRIVE").cloned().unwrap_or_default(),
            rclone_path: map.get("RCLONE_PATH").cloned().unwrap_or_default(),
            rclone_flags: map
                .get("RCLONE_FLAGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            saved: flag("ARCHIVE_SAVEDCLIPS", true),
            sentry: flag("ARCHIVE_SENTRYCLIPS", true),
            recent: flag("ARCHIVE_RECENTCLIPS", false),
            track: flag("ARCHIVE_TRACKMODECLIPS", true),
        };

        let cam_size = match map.get("CAM_SIZE") {
            Some(value) => Some(parse_size(value)?),
            None => None,
        };

        Ok(Config {
            backingfiles_path: map
                .get("BACKINGFILES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.backingfiles_path),
            archive,
            cam_size,
            idle_timeout: secs("IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            poll_base: secs("POLL_BASE_SECS", defaults.poll_base)?,
            poll_max: secs("POLL_MAX_SECS", defaults.poll_max)?,
        })
    }

    /// Load from process environment variables
    pub fn load_from_env() -> ConfigResult<Config> {
        let map: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_map(&map)
    }

    /// Load from a shell-style `KEY=VALUE` config file
    pub fn load_from_file(path: &Path) -> ConfigResult<Config> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let mut map = BTreeMap::new();
        for line in std::fs::read_to_string(path)?.lines() {
            let mut line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("export ") {
                line = rest.trim();
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            let mut value = value.trim();
            if value.len() >= 2 {
                let bytes = value.as_bytes();
                if (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[0] == bytes[value.len() - 1] {
                    value = &value[1..value.len() - 1];
                }
            }
            map.insert(key, value.to_string());
        }

        Self::from_map(&map)
    }
}

/// Parse a size string like `40G`, `500M`, `1024K`, or plain bytes.
///
/// Percentages are rejected; the sizing formula owns proportional sizing.
pub fn parse_size(size_str: &str) -> ConfigResult<u64> {
    let normalized = size_str.trim().to_uppercase();

    if normalized.ends_with('%') {
        return Err(ConfigError::InvalidSize(size_str.to_string()));
    }

    let re = Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]?B?)?$").expect("static regex");
    let caps = re
        .captures(&normalized)
        .ok_or_else(|| ConfigError::InvalidSize(size_str.to_string()))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| ConfigError::InvalidSize(size_str.to_string()))?;
    let suffix = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let suffix = suffix.trim_end_matches('B');

    let multiplier: u64 = match suffix {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return Err(ConfigError::InvalidSize(size_str.to_string())),
    };

    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_size_plain_and_suffixed() {
        assert_eq!(parse_size("1000000").unwrap(), 1_000_000);
        assert_eq!(parse_size("1024K").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("500M").unwrap(), 500 << 20);
        assert_eq!(parse_size("40G").unwrap(), 40 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert_eq!(parse_size("40GB").unwrap(), 40 << 30);
        assert_eq!(parse_size(" 40g ").unwrap(), 40 << 30);
        assert_eq!(parse_size("2.5G").unwrap(), (2.5 * (1u64 << 30) as f64) as u64);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("50%").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("40X").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backingfiles_path, PathBuf::from("/backingfiles"));
        assert_eq!(config.live_image_path(), PathBuf::from("/backingfiles/cam_disk.bin"));
        assert_eq!(config.snapshots_path(), PathBuf::from("/backingfiles/snapshots"));
        assert_eq!(config.archive.system, "none");
        assert!(config.archive.saved);
        assert!(!config.archive.recent);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_load_from_file_shell_style() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "# setup variables\n\
             export ARCHIVE_SYSTEM=rclone\n\
             RCLONE_DRIVE='gdrive'\n\
             RCLONE_PATH=\"TeslaCam/archive\"\n\
             RCLONE_FLAGS=--fast-list --transfers 4\n\
             ARCHIVE_RECENTCLIPS=true\n\
             ARCHIVE_SENTRYCLIPS=false\n\
             CAM_SIZE=40G\n\
             POLL_BASE_SECS=10"
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();

        assert_eq!(config.archive.system, "rclone");
        assert_eq!(config.archive.rclone_remote, "gdrive");
        assert_eq!(config.archive.rclone_path, "TeslaCam/archive");
        assert_eq!(config.archive.rclone_flags, vec!["--fast-list", "--transfers", "4"]);
        assert!(config.archive.recent);
        assert!(!config.archive.sentry);
        assert!(config.archive.saved);
        assert_eq!(config.cam_size, Some(40 << 30));
        assert_eq!(config.poll_base, Duration::from_secs(10));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load_from_file(Path::new("/nonexistent.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_invalid_duration_value() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "IDLE_TIMEOUT_SECS=ninety").unwrap();

        let err = Config::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_flags_problems() {
        let mut config = Config::default();
        config.archive.system = "ftp".to_string();
        config.poll_base = Duration::from_secs(600);
        config.cam_size = Some(1000);

        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("unknown archive system"));
    }

    #[test]
    fn test_rclone_without_remote_warns() {
        let mut config = Config::default();
        config.archive.system = "rclone".to_string();

        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("RCLONE_DRIVE"));
    }
}
