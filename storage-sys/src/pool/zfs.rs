// SPDX-License-Identifier: GPL-3.0-only

//! zfs pools driven through `zpool` and `zfs`.
//!
//! The pool reference is a name chosen by this layer. Attachment is a pool
//! property, so mounting means retargeting `mountpoint`.

use std::path::{Path, PathBuf};

use storage_types::{AddOutcome, BackendKind, PoolSize, RaidProfile, parse_size};
use tracing::{debug, info, warn};

use super::{Host, PoolBackend, StoragePool, creation_devices};
use crate::cmd::{CommandExecutor, argv};
use crate::error::{Result, SysError};

/// Name given to pools created by this backend.
pub const DEFAULT_POOL_NAME: &str = "docker";

const REQUIRED_TOOLS: &[&str] = &["zpool", "zfs"];

const DEVICE_MARKER: &str = "/dev/";

/// Headers of `zpool list -v` sections whose vdevs hold no pool data.
const AUX_SECTIONS: &[&str] = &["logs", "log", "cache", "spares", "spare"];

/// A vdev path from `zpool list -v -H -P` and whether it sits in a
/// logs, cache or spares section.
struct Vdev {
    path: String,
    auxiliary: bool,
}

/// Group rows such as `raidz1-0` and pool summary rows carry no device path
/// and are skipped. A summary row starts a new pool and closes any auxiliary
/// section.
fn parse_vdevs(output: &str) -> Vec<Vdev> {
    let mut vdevs = Vec::new();
    let mut auxiliary = false;
    for line in output.lines() {
        let indented = line.starts_with(char::is_whitespace);
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };
        if AUX_SECTIONS.contains(&first) {
            auxiliary = true;
            continue;
        }
        if !indented {
            auxiliary = false;
            continue;
        }
        if let Some(path) = std::iter::once(first)
            .chain(tokens)
            .find(|token| token.starts_with(DEVICE_MARKER))
        {
            vdevs.push(Vdev {
                path: path.to_string(),
                auxiliary,
            });
        }
    }
    vdevs
}

/// Data vdev paths only; log, cache and spare devices are not members.
fn parse_vdev_paths(output: &str) -> Vec<String> {
    parse_vdevs(output)
        .into_iter()
        .filter(|vdev| !vdev.auxiliary)
        .map(|vdev| vdev.path)
        .collect()
}

/// Whether `reported`, a path printed by `zpool`, is `device`.
///
/// Given a whole disk, zpool writes a GPT label and reports the first
/// partition: `/dev/sdb1`, `/dev/nvme0n1p1` or `/dev/disk/by-id/...-part1`.
fn is_same_vdev(reported: &str, device: &str) -> bool {
    if reported == device {
        return true;
    }
    let Some(suffix) = reported.strip_prefix(device) else {
        return false;
    };
    match suffix {
        "1" => !device.ends_with(|c: char| c.is_ascii_digit()),
        "p1" => device.ends_with(|c: char| c.is_ascii_digit()),
        "-part1" => true,
        _ => false,
    }
}

fn parse_pool_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(ToString::to_string)
        .collect()
}

/// Columns of `zfs list -H`: name, used, avail, refer, mountpoint.
fn parse_dataset_size(output: &str) -> Result<PoolSize> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| SysError::Parse("empty zfs list output".to_string()))?;

    let cols: Vec<&str> = if line.contains('\t') {
        line.split('\t').map(str::trim).collect()
    } else {
        line.split_whitespace().collect()
    };
    if cols.len() < 3 {
        return Err(SysError::Parse(format!("unexpected zfs list row: {line}")));
    }

    let used_bytes = parse_reported_size(cols[1])?;
    let available_bytes = parse_reported_size(cols[2])?;

    Ok(PoolSize {
        used_bytes,
        total_bytes: used_bytes.saturating_add(available_bytes),
    })
}

fn parse_reported_size(value: &str) -> Result<u64> {
    parse_size(value).map_err(|error| SysError::Parse(format!("{value:?}: {error}")))
}

/// Vdev layout for a pool of `device_count` members; `None` lets zpool
/// stripe the devices.
pub fn topology(device_count: usize) -> Option<RaidProfile> {
    if device_count > 2 {
        Some(RaidProfile::Raidz)
    } else {
        None
    }
}

pub struct ZfsBackend<'a> {
    host: Host<'a>,
    pool_name: String,
}

impl<'a> ZfsBackend<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self {
            host: Host::new(executor),
            pool_name: DEFAULT_POOL_NAME.to_string(),
        }
    }

    pub fn with_mountinfo(mut self, path: impl Into<PathBuf>) -> Self {
        self.host.mountinfo = path.into();
        self
    }

    pub fn with_pool_name(mut self, pool_name: impl Into<String>) -> Self {
        self.pool_name = pool_name.into();
        self
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn pool_names(&self) -> Result<Vec<String>> {
        let output = self.host.run(argv(["zpool", "list", "-H", "-o", "name"]))?;
        Ok(parse_pool_names(&output))
    }

    /// Every vdev path used by any imported pool, spares and caches included.
    fn claimed_devices(&self) -> Result<Vec<String>> {
        let output = self.host.run(argv(["zpool", "list", "-v", "-H", "-P"]))?;
        Ok(parse_vdevs(&output).into_iter().map(|vdev| vdev.path).collect())
    }

    fn ensure_unclaimed(&self, devices: &[String]) -> Result<()> {
        let claimed = self.claimed_devices()?;
        if let Some(device) = devices.iter().find(|device| {
            claimed
                .iter()
                .any(|reported| is_same_vdev(reported, device))
        }) {
            warn!("{} belongs to an imported zfs pool", device);
            return Err(SysError::DeviceInUse {
                device: device.clone(),
            });
        }
        Ok(())
    }

    /// `None` when the dataset is not mounted by zfs (`none`, `legacy`).
    fn mountpoint_property(&self, name: &str) -> Result<Option<PathBuf>> {
        let output = self
            .host
            .run(argv(["zfs", "get", "-H", "-o", "value", "mountpoint", name]))?;
        Ok(match output.trim() {
            "" | "-" | "none" | "legacy" => None,
            value => Some(PathBuf::from(value)),
        })
    }

    /// Attach to the managed pool and target it at `mount_point`.
    pub fn open_at(&self, mount_point: &Path) -> Result<StoragePool> {
        let pool = self.attach(&self.pool_name)?;
        Ok(retarget(pool, mount_point))
    }
}

fn retarget(pool: StoragePool, mount_point: &Path) -> StoragePool {
    if pool.mount_point() == mount_point {
        return pool;
    }
    debug!(
        "zfs pool {} is mounted at {:?}, expected {:?}",
        pool.reference(),
        pool.mount_point(),
        mount_point
    );
    StoragePool::new(
        BackendKind::Zfs,
        pool.reference(),
        mount_point,
        pool.devices().to_vec(),
    )
}

fn require_name(pool: &StoragePool) -> Result<&str> {
    let name = pool.reference();
    if name.is_empty() {
        return Err(SysError::MissingPoolName);
    }
    Ok(name)
}

impl PoolBackend for ZfsBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Zfs
    }

    fn topology(&self, device_count: usize) -> Option<RaidProfile> {
        topology(device_count)
    }

    fn ensure_tools(&self) -> Result<()> {
        if !cfg!(feature = "zfs-tools") {
            return Err(SysError::ToolsNotFound {
                tool: "zpool".to_string(),
            });
        }
        self.host.ensure_tools(REQUIRED_TOOLS)
    }

    fn create(&self, mount_point: &Path, devices: &[String], force: bool) -> Result<StoragePool> {
        self.ensure_tools()?;
        let devices = creation_devices(devices)?;
        if !mount_point.is_absolute() {
            return Err(SysError::InvalidMountPoint(mount_point.to_path_buf()));
        }
        if !force {
            self.host.ensure_unmounted(&devices)?;
            self.ensure_unclaimed(&devices)?;
        }

        let mut command = argv(["zpool", "create"]);
        if force {
            command.push("-f".to_string());
        }
        command.push("-m".to_string());
        command.push(mount_point.to_string_lossy().to_string());
        command.push(self.pool_name.clone());
        if let Some(profile) = topology(devices.len()) {
            command.push(profile.as_arg().to_string());
        }
        command.extend(devices.iter().cloned());

        info!(
            "Creating zfs pool {} on {} at {:?}",
            self.pool_name,
            devices.join(", "),
            mount_point
        );
        self.host.run(command)?;

        Ok(StoragePool::new(
            BackendKind::Zfs,
            self.pool_name.as_str(),
            mount_point,
            devices,
        ))
    }

    fn attach(&self, reference: &str) -> Result<StoragePool> {
        if reference.is_empty() {
            return Err(SysError::MissingPoolName);
        }
        self.ensure_tools()?;

        if !self.pool_names()?.iter().any(|name| name == reference) {
            return Err(SysError::NotFound(reference.to_string()));
        }

        let mount_point = self.mountpoint_property(reference)?.unwrap_or_else(|| {
            debug!("zfs pool {} has no mountpoint", reference);
            PathBuf::new()
        });
        let mut pool = StoragePool::new(BackendKind::Zfs, reference, mount_point, Vec::new());
        let devices = self.list_devices(&pool)?;
        pool.set_devices(devices);
        Ok(pool)
    }

    /// The managed pool name is the identity here; devices owned by other
    /// pools are refused by `create` instead.
    fn discover(&self, mount_point: &Path, _devices: &[String]) -> Result<Option<StoragePool>> {
        self.ensure_tools()?;
        if !self.pool_names()?.iter().any(|name| *name == self.pool_name) {
            return Ok(None);
        }
        self.open_at(mount_point).map(Some)
    }

    fn add(&self, pool: &mut StoragePool, device: &str) -> Result<AddOutcome> {
        let name = require_name(pool)?.to_string();
        self.ensure_tools()?;

        let members = self.list_devices(pool)?;
        if members.iter().any(|member| is_same_vdev(member, device)) {
            debug!("{} is already a member of {}", device, name);
            pool.set_devices(members);
            return Ok(AddOutcome::AlreadyMember);
        }

        self.host.ensure_unmounted(&[device.to_string()])?;
        self.ensure_unclaimed(&[device.to_string()])?;

        info!("Adding {} to zfs pool {}", device, name);
        self.host.run(argv(["zpool", "add", name.as_str(), device]))?;

        pool.set_devices(members);
        pool.push_device(device);
        Ok(AddOutcome::Added)
    }

    fn mount(&self, pool: &StoragePool) -> Result<()> {
        let name = require_name(pool)?;
        if !pool.mount_point().is_absolute() {
            return Err(SysError::InvalidMountPoint(pool.mount_point().to_path_buf()));
        }
        self.host.ensure_mount_dir(pool.mount_point())?;

        info!("Setting mountpoint of {} to {:?}", name, pool.mount_point());
        let property = format!("mountpoint={}", pool.mount_point().display());
        self.host
            .run(argv(["zfs", "set", property.as_str(), name]))?;
        Ok(())
    }

    fn unmount(&self, pool: &StoragePool, force: bool) -> Result<()> {
        let name = require_name(pool)?;
        let mut command = argv(["zfs", "unmount"]);
        if force {
            command.push("-f".to_string());
        }
        command.push(name.to_string());

        info!("Unmounting zfs pool {}", name);
        self.host.run(command)?;
        Ok(())
    }

    fn rebalance(&self, pool: &StoragePool) -> Result<()> {
        debug!("zfs distributes writes itself; nothing to rebalance for {}", pool.reference());
        Ok(())
    }

    fn size(&self, pool: &StoragePool) -> Result<PoolSize> {
        let name = require_name(pool)?;
        let output = self.host.run(argv(["zfs", "list", "-H", name]))?;
        parse_dataset_size(&output)
    }

    fn list_devices(&self, pool: &StoragePool) -> Result<Vec<String>> {
        let name = require_name(pool)?;
        let output = self
            .host
            .run(argv(["zpool", "list", "-v", "-H", "-P", name]))?;
        // Report the paths the pool was built from, not zpool's partitions.
        Ok(parse_vdev_paths(&output)
            .into_iter()
            .map(|reported| {
                pool.devices()
                    .iter()
                    .find(|device| is_same_vdev(&reported, device))
                    .cloned()
                    .unwrap_or(reported)
            })
            .collect())
    }
}
