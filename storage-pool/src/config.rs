// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use storage_sys::mounts::DEFAULT_MOUNTINFO;
use storage_types::BackendKind;

use crate::error::{PoolError, Result};

/// Default location of the container runtime's data directory.
pub const DEFAULT_MOUNT_POINT: &str = "/var/lib/docker";

/// Pool settings, computed once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub backend: BackendKind,
    pub mount_point: PathBuf,
    /// Skip the "device is mounted" guard and pass `-f` where supported.
    pub force: bool,
    /// Devices used when a request names none.
    pub devices: Vec<String>,
    pub mountinfo: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            force: false,
            devices: Vec::new(),
            mountinfo: PathBuf::from(DEFAULT_MOUNTINFO),
        }
    }
}

impl PoolConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PoolError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let raw = fs::read_to_string(path).map_err(|error| PoolError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;

        let config = Self::parse(&raw).map_err(|reason| PoolError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })?;

        config.validate_at(path)?;
        Ok(config)
    }

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        toml::from_str(raw).map_err(|error| error.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_at(Path::new("<arguments>"))
    }

    fn validate_at(&self, path: &Path) -> Result<()> {
        if !self.mount_point.is_absolute() {
            return Err(PoolError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: format!(
                    "mount_point must be an absolute path, got {:?}",
                    self.mount_point
                ),
            });
        }

        if self.devices.iter().any(|device| device.trim().is_empty()) {
            return Err(PoolError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: "devices must not contain empty entries".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage-pool.toml");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_keys_use_defaults() {
        let (_dir, path) = write_config("backend = \"zfs\"\n");
        let config = PoolConfig::load(&path).unwrap();

        assert_eq!(config.backend, BackendKind::Zfs);
        assert_eq!(config.mount_point, Path::new(DEFAULT_MOUNT_POINT));
        assert!(!config.force);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn loads_full_config() {
        let (_dir, path) = write_config(
            "backend = \"btrfs\"\nmount_point = \"/data\"\nforce = true\ndevices = [\"/dev/sdb\", \"/dev/sdc\"]\n",
        );
        let config = PoolConfig::load(&path).unwrap();

        assert_eq!(config.mount_point, Path::new("/data"));
        assert!(config.force);
        assert_eq!(config.devices, vec!["/dev/sdb", "/dev/sdc"]);
    }

    #[test]
    fn unknown_backend_is_invalid() {
        let (_dir, path) = write_config("backend = \"lvm\"\n");
        assert!(matches!(
            PoolConfig::load(&path),
            Err(PoolError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn relative_mount_point_is_invalid() {
        let (_dir, path) = write_config("mount_point = \"data\"\n");
        assert!(matches!(
            PoolConfig::load(&path),
            Err(PoolError::ConfigInvalid { reason, .. }) if reason.contains("absolute")
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PoolConfig::load(&dir.path().join("absent.toml")),
            Err(PoolError::ConfigNotFound { .. })
        ));
    }
}
