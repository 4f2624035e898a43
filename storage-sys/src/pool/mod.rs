// SPDX-License-Identifier: GPL-3.0-only

//! Pool backend contract and its closed set of implementations.

pub mod btrfs;
pub mod zfs;

use std::fs;
use std::path::{Path, PathBuf};

use storage_types::{AddOutcome, BackendKind, PoolInfo, PoolSize, RaidProfile};
use tracing::{debug, warn};

use crate::cmd::CommandExecutor;
use crate::error::{Result, SysError};
use crate::mounts::{DEFAULT_MOUNTINFO, MountTable};

pub use btrfs::BtrfsBackend;
pub use zfs::ZfsBackend;

/// Handle to a pool that exists on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePool {
    kind: BackendKind,
    reference: String,
    mount_point: PathBuf,
    devices: Vec<String>,
}

impl StoragePool {
    pub(crate) fn new(
        kind: BackendKind,
        reference: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        devices: Vec<String>,
    ) -> Self {
        Self {
            kind,
            reference: reference.into(),
            mount_point: mount_point.into(),
            devices: dedup_devices(&devices),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Mount path for btrfs, pool name for zfs. Never changes after creation.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Members as last reported by the backend tool.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn contains(&self, device: &str) -> bool {
        self.devices.iter().any(|member| member == device)
    }

    pub(crate) fn set_devices(&mut self, devices: Vec<String>) {
        self.devices = dedup_devices(&devices);
    }

    pub(crate) fn push_device(&mut self, device: &str) {
        if !self.contains(device) {
            self.devices.push(device.to_string());
        }
    }

    pub fn info(&self, size: Option<PoolSize>) -> PoolInfo {
        PoolInfo {
            backend: self.kind,
            reference: self.reference.clone(),
            mount_point: self.mount_point.clone(),
            devices: self.devices.clone(),
            size,
        }
    }
}

/// Operations every pool backend provides.
pub trait PoolBackend {
    fn kind(&self) -> BackendKind;

    /// Redundancy profile used when creating a pool from `device_count` devices.
    fn topology(&self, device_count: usize) -> Option<RaidProfile>;

    /// Fail with `ToolsNotFound` unless every management binary is installed.
    fn ensure_tools(&self) -> Result<()>;

    /// Format `devices` into a new pool and attach it at `mount_point`.
    /// Destroys whatever the devices held before.
    fn create(&self, mount_point: &Path, devices: &[String], force: bool) -> Result<StoragePool>;

    /// Open an existing pool; `NotFound` when `reference` does not exist.
    fn attach(&self, reference: &str) -> Result<StoragePool>;

    /// Existing pool for this backend at `mount_point`, or one that already
    /// owns any of `devices`. The returned pool may still need mounting.
    fn discover(&self, mount_point: &Path, devices: &[String]) -> Result<Option<StoragePool>>;

    fn add(&self, pool: &mut StoragePool, device: &str) -> Result<AddOutcome>;

    fn mount(&self, pool: &StoragePool) -> Result<()>;

    fn unmount(&self, pool: &StoragePool, force: bool) -> Result<()>;

    fn rebalance(&self, pool: &StoragePool) -> Result<()>;

    fn size(&self, pool: &StoragePool) -> Result<PoolSize>;

    fn list_devices(&self, pool: &StoragePool) -> Result<Vec<String>>;
}

/// Closed set of backends, selected by configuration.
pub enum Backend<'a> {
    Btrfs(BtrfsBackend<'a>),
    Zfs(ZfsBackend<'a>),
}

impl<'a> Backend<'a> {
    pub fn new(kind: BackendKind, executor: &'a dyn CommandExecutor) -> Self {
        match kind {
            BackendKind::Btrfs => Backend::Btrfs(BtrfsBackend::new(executor)),
            BackendKind::Zfs => Backend::Zfs(ZfsBackend::new(executor)),
        }
    }

    /// Read the mount table from `path` instead of `/proc/self/mountinfo`.
    pub fn with_mountinfo(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Backend::Btrfs(backend) => Backend::Btrfs(backend.with_mountinfo(path)),
            Backend::Zfs(backend) => Backend::Zfs(backend.with_mountinfo(path)),
        }
    }

    /// Attach to the pool this backend manages at `mount_point`.
    ///
    /// zfs pools are returned targeting `mount_point` so the next `mount`
    /// retargets them.
    pub fn open(&self, mount_point: &Path) -> Result<StoragePool> {
        match self {
            Backend::Btrfs(backend) => backend.attach(&mount_point.to_string_lossy()),
            Backend::Zfs(backend) => backend.open_at(mount_point),
        }
    }
}

macro_rules! dispatch {
    ($backend:expr, $inner:ident => $call:expr) => {
        match $backend {
            Backend::Btrfs($inner) => $call,
            Backend::Zfs($inner) => $call,
        }
    };
}

impl PoolBackend for Backend<'_> {
    fn kind(&self) -> BackendKind {
        dispatch!(self, backend => backend.kind())
    }

    fn topology(&self, device_count: usize) -> Option<RaidProfile> {
        dispatch!(self, backend => backend.topology(device_count))
    }

    fn ensure_tools(&self) -> Result<()> {
        dispatch!(self, backend => backend.ensure_tools())
    }

    fn create(&self, mount_point: &Path, devices: &[String], force: bool) -> Result<StoragePool> {
        dispatch!(self, backend => backend.create(mount_point, devices, force))
    }

    fn attach(&self, reference: &str) -> Result<StoragePool> {
        dispatch!(self, backend => backend.attach(reference))
    }

    fn discover(&self, mount_point: &Path, devices: &[String]) -> Result<Option<StoragePool>> {
        dispatch!(self, backend => backend.discover(mount_point, devices))
    }

    fn add(&self, pool: &mut StoragePool, device: &str) -> Result<AddOutcome> {
        dispatch!(self, backend => backend.add(pool, device))
    }

    fn mount(&self, pool: &StoragePool) -> Result<()> {
        dispatch!(self, backend => backend.mount(pool))
    }

    fn unmount(&self, pool: &StoragePool, force: bool) -> Result<()> {
        dispatch!(self, backend => backend.unmount(pool, force))
    }

    fn rebalance(&self, pool: &StoragePool) -> Result<()> {
        dispatch!(self, backend => backend.rebalance(pool))
    }

    fn size(&self, pool: &StoragePool) -> Result<PoolSize> {
        dispatch!(self, backend => backend.size(pool))
    }

    fn list_devices(&self, pool: &StoragePool) -> Result<Vec<String>> {
        dispatch!(self, backend => backend.list_devices(pool))
    }
}

/// Plumbing shared by both backends.
pub(crate) struct Host<'a> {
    pub(crate) executor: &'a dyn CommandExecutor,
    pub(crate) mountinfo: PathBuf,
}

impl<'a> Host<'a> {
    pub(crate) fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self {
            executor,
            mountinfo: PathBuf::from(DEFAULT_MOUNTINFO),
        }
    }

    pub(crate) fn run(&self, argv: Vec<String>) -> Result<String> {
        Ok(self.executor.execute(&argv)?.stdout)
    }

    pub(crate) fn ensure_tools(&self, tools: &[&str]) -> Result<()> {
        for tool in tools {
            match self.executor.find_tool(tool) {
                Some(path) => debug!("Found {} at {:?}", tool, path),
                None => {
                    return Err(SysError::ToolsNotFound {
                        tool: tool.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn mount_table(&self) -> Result<MountTable> {
        MountTable::load(&self.mountinfo)
    }

    /// Reject devices that are mounted somewhere on this host.
    pub(crate) fn ensure_unmounted(&self, devices: &[String]) -> Result<()> {
        let table = self.mount_table()?;
        if let Some(device) = devices
            .iter()
            .find(|device| table.is_source_mounted(device))
        {
            warn!("Refusing to use mounted device {}", device);
            return Err(SysError::DeviceInUse {
                device: device.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_mount_dir(&self, mount_point: &Path) -> Result<()> {
        if !mount_point.exists() {
            if self.executor.dry_run() {
                debug!("Dry run, not creating mount point {:?}", mount_point);
                return Ok(());
            }
            debug!("Creating mount point {:?}", mount_point);
            fs::create_dir_all(mount_point)?;
        }
        Ok(())
    }
}

/// Validate a creation device list: non-empty, first occurrence wins.
pub(crate) fn creation_devices(devices: &[String]) -> Result<Vec<String>> {
    let devices = dedup_devices(devices);
    if devices.is_empty() {
        return Err(SysError::NoDevices);
    }
    Ok(devices)
}

fn dedup_devices(devices: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(devices.len());
    for device in devices {
        let device = device.trim();
        if !device.is_empty() && !unique.iter().any(|existing| existing == device) {
            unique.push(device.to_string());
        }
    }
    unique
}
