// SPDX-License-Identifier: GPL-3.0-only

//! Create-or-extend decision for the pool at the configured mount point.
//!
//! `NoPool` moves to `PoolExists` on a successful create; `PoolExists` stays
//! there on every extension. Pools are never destroyed here.

use serde::Serialize;
use storage_sys::{Backend, CommandExecutor, PoolBackend, StoragePool, SysError};
use storage_types::AddOutcome;
use tracing::info;

use crate::config::PoolConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    NoPool,
    PoolExists,
}

/// Result of one provisioning request.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub pool: StoragePool,
    /// State before the request was handled.
    pub previous: PoolState,
    /// Devices that joined the pool during this request.
    pub added: Vec<String>,
}

pub struct PoolRegistry<'a> {
    config: PoolConfig,
    executor: &'a dyn CommandExecutor,
}

impl<'a> PoolRegistry<'a> {
    pub fn new(config: PoolConfig, executor: &'a dyn CommandExecutor) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backend(&self) -> Backend<'a> {
        Backend::new(self.config.backend, self.executor).with_mountinfo(&self.config.mountinfo)
    }

    /// Current state and, when present, the pool at the configured mount point
    /// or on the configured devices.
    pub fn state(&self) -> Result<(PoolState, Option<StoragePool>)> {
        let existing = self
            .backend()
            .discover(&self.config.mount_point, &self.config.devices)?;
        let state = if existing.is_some() {
            PoolState::PoolExists
        } else {
            PoolState::NoPool
        };
        Ok((state, existing))
    }

    /// Attach to the configured pool; fails with `NotFound` if it is absent.
    /// The pool targets the configured mount point.
    pub fn open(&self) -> Result<StoragePool> {
        let pool = self.backend().open(&self.config.mount_point)?;
        Ok(pool)
    }

    /// Extend the existing pool with `devices`, or create one from them.
    ///
    /// An empty `devices` falls back to the configured device list. A pool
    /// found on those devices but not mounted is mounted, never reformatted.
    pub fn provision(&self, devices: &[String]) -> Result<Provisioned> {
        let devices = if devices.is_empty() {
            self.config.devices.as_slice()
        } else {
            devices
        };

        let backend = self.backend();
        match backend.discover(&self.config.mount_point, devices)? {
            Some(mut pool) => {
                // btrfs grows through its mount path.
                backend.mount(&pool)?;

                let mut added = Vec::new();
                for device in devices {
                    if backend.add(&mut pool, device)? == AddOutcome::Added {
                        added.push(device.clone());
                    }
                }

                info!(
                    "Extended {} pool {} with {} device(s)",
                    backend.kind(),
                    pool.reference(),
                    added.len()
                );
                Ok(Provisioned {
                    pool,
                    previous: PoolState::PoolExists,
                    added,
                })
            }
            None => {
                if devices.is_empty() {
                    return Err(SysError::NoDevices.into());
                }

                let pool = backend.create(&self.config.mount_point, devices, self.config.force)?;
                info!(
                    "Created {} pool {} from {} device(s)",
                    backend.kind(),
                    pool.reference(),
                    pool.devices().len()
                );
                Ok(Provisioned {
                    added: pool.devices().to_vec(),
                    pool,
                    previous: PoolState::NoPool,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use storage_sys::RecordingExecutor;
    use storage_types::BackendKind;

    use super::*;
    use crate::error::PoolError;

    const BTRFS_SHOW: &str = "Label: none  uuid: 6b1a7b6e\n\tTotal devices 1 FS bytes used 144.00KiB\n\tdevid    1 size 1.00GiB used 228.75MiB path /dev/sdb\n";

    struct Lab {
        dir: tempfile::TempDir,
    }

    impl Lab {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("mountinfo"), "").unwrap();
            Self { dir }
        }

        fn data(&self) -> PathBuf {
            self.dir.path().join("data")
        }

        fn mount_btrfs(&self) {
            fs::create_dir_all(self.data()).unwrap();
            fs::write(
                self.dir.path().join("mountinfo"),
                format!("90 36 0:61 / {} rw - btrfs /dev/sdb rw\n", self.data().display()),
            )
            .unwrap();
        }

        fn config(&self, backend: BackendKind) -> PoolConfig {
            PoolConfig {
                backend,
                mount_point: self.data(),
                mountinfo: self.dir.path().join("mountinfo"),
                ..PoolConfig::default()
            }
        }
    }

    fn devices(paths: &[&str]) -> Vec<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn no_pool_creates_btrfs() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new();
        let registry = PoolRegistry::new(lab.config(BackendKind::Btrfs), &executor);

        let provisioned = registry.provision(&devices(&["/dev/a", "/dev/b"])).unwrap();

        assert_eq!(provisioned.previous, PoolState::NoPool);
        assert_eq!(provisioned.added, devices(&["/dev/a", "/dev/b"]));
        assert!(
            executor
                .calls()
                .contains(&devices(&["mkfs.btrfs", "-f", "-d", "raid1", "/dev/a", "/dev/b"]))
        );
    }

    #[test]
    fn unmounted_btrfs_on_requested_device_is_mounted_not_formatted() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new()
            .respond(&["btrfs", "filesystem", "show", "-m"], BTRFS_SHOW)
            .respond(&["btrfs", "filesystem", "show"], BTRFS_SHOW);
        let mut config = lab.config(BackendKind::Btrfs);
        config.devices = devices(&["/dev/sdb"]);
        let registry = PoolRegistry::new(config, &executor);

        assert_eq!(registry.state().unwrap().0, PoolState::PoolExists);

        let provisioned = registry.provision(&[]).unwrap();

        assert_eq!(provisioned.previous, PoolState::PoolExists);
        assert!(provisioned.added.is_empty());
        assert_eq!(provisioned.pool.devices(), ["/dev/sdb"]);

        let calls = executor.rendered_calls();
        assert!(!calls.iter().any(|call| call.starts_with("mkfs.btrfs")));
        assert!(calls.contains(&format!("mount /dev/sdb {}", lab.data().display())));
    }

    #[test]
    fn existing_pool_is_extended() {
        let lab = Lab::new();
        lab.mount_btrfs();
        let executor = RecordingExecutor::new()
            .respond(&["btrfs", "filesystem", "show", "-m"], BTRFS_SHOW)
            .respond(&["btrfs", "filesystem", "show"], BTRFS_SHOW);
        let registry = PoolRegistry::new(lab.config(BackendKind::Btrfs), &executor);

        let provisioned = registry
            .provision(&devices(&["/dev/sdb", "/dev/sdc"]))
            .unwrap();

        assert_eq!(provisioned.previous, PoolState::PoolExists);
        assert_eq!(provisioned.added, devices(&["/dev/sdc"]));
        assert_eq!(provisioned.pool.devices(), ["/dev/sdb", "/dev/sdc"]);

        let calls = executor.rendered_calls();
        assert!(!calls.iter().any(|call| call.starts_with("mkfs.btrfs")));
        assert_eq!(
            calls
                .iter()
                .filter(|call| call.starts_with("btrfs device add"))
                .count(),
            1
        );
        assert!(calls.iter().any(|call| call.starts_with("btrfs balance")));
    }

    #[test]
    fn configured_devices_are_the_fallback() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new();
        let mut config = lab.config(BackendKind::Btrfs);
        config.devices = devices(&["/dev/sdx"]);
        let registry = PoolRegistry::new(config, &executor);

        registry.provision(&[]).unwrap();

        assert!(
            executor
                .calls()
                .contains(&devices(&["mkfs.btrfs", "-f", "-d", "raid0", "/dev/sdx"]))
        );
    }

    #[test]
    fn no_pool_and_no_devices_fails() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new();
        let registry = PoolRegistry::new(lab.config(BackendKind::Btrfs), &executor);

        assert!(matches!(
            registry.provision(&[]),
            Err(PoolError::Sys(SysError::NoDevices))
        ));
    }

    #[test]
    fn zfs_without_pool_creates_one() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new().respond(&["zpool", "list", "-H", "-o", "name"], "rpool\n");
        let registry = PoolRegistry::new(lab.config(BackendKind::Zfs), &executor);

        let provisioned = registry
            .provision(&devices(&["/dev/a", "/dev/b", "/dev/c"]))
            .unwrap();

        assert_eq!(provisioned.previous, PoolState::NoPool);
        assert_eq!(provisioned.pool.reference(), "docker");
        let calls = executor.rendered_calls();
        assert!(
            calls
                .last()
                .unwrap()
                .ends_with("docker raidz /dev/a /dev/b /dev/c")
        );
    }

    #[test]
    fn state_reports_existing_pool() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new().respond(&["btrfs", "filesystem", "show"], BTRFS_SHOW);
        let registry = PoolRegistry::new(lab.config(BackendKind::Btrfs), &executor);

        assert_eq!(registry.state().unwrap().0, PoolState::NoPool);
        lab.mount_btrfs();
        assert_eq!(registry.state().unwrap().0, PoolState::PoolExists);
    }

    #[test]
    fn open_zfs_targets_configured_mount_point() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new()
            .respond(&["zpool", "list", "-H", "-o", "name"], "docker\n")
            .respond(&["zfs", "get"], "none\n")
            .respond(&["zpool", "list", "-v"], "docker\t9.50G\t-\n\t/dev/sdb\t9.50G\t-\n");
        let registry = PoolRegistry::new(lab.config(BackendKind::Zfs), &executor);

        let pool = registry.open().unwrap();
        assert_eq!(pool.mount_point(), lab.data());

        registry.backend().mount(&pool).unwrap();
        assert_eq!(
            executor.rendered_calls().last().unwrap(),
            &format!("zfs set mountpoint={} docker", lab.data().display())
        );
    }

    #[test]
    fn open_missing_btrfs_pool_is_not_found() {
        let lab = Lab::new();
        let executor = RecordingExecutor::new();
        let registry = PoolRegistry::new(lab.config(BackendKind::Btrfs), &executor);

        assert!(matches!(
            registry.open(),
            Err(PoolError::Sys(SysError::NotFound(_)))
        ));
        assert!(executor.calls().is_empty());
    }
}
