// SPDX-License-Identifier: GPL-3.0-only

//! btrfs pools driven through `mkfs.btrfs`, `btrfs`, `mount` and `umount`.
//!
//! The pool reference is its mount path. Membership and capacity come from
//! `btrfs filesystem show`, which is parsed in exactly one place.

use std::path::{Path, PathBuf};

use storage_types::{AddOutcome, BackendKind, PoolSize, RaidProfile, parse_size};
use tracing::{debug, info, warn};

use super::{Host, PoolBackend, StoragePool, creation_devices};
use crate::cmd::{CommandExecutor, argv};
use crate::error::{Result, SysError};

const REQUIRED_TOOLS: &[&str] = &["mkfs.btrfs", "btrfs", "mount", "umount"];

/// Lines carrying a member device contain this marker.
const DEVICE_MARKER: &str = "/dev/";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BtrfsFs {
    uuid: Option<String>,
    used_bytes: Option<u64>,
    devices: Vec<(String, u64)>,
}

fn parse_filesystem_show(output: &str) -> Result<Vec<BtrfsFs>> {
    let mut filesystems = Vec::new();
    let mut current: Option<BtrfsFs> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("Label:") {
            if let Some(previous) = current.take() {
                filesystems.push(previous);
            }

            let uuid = line
                .split("uuid:")
                .nth(1)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string);

            current = Some(BtrfsFs {
                uuid,
                ..BtrfsFs::default()
            });
            continue;
        }

        let current_fs = current.get_or_insert_with(BtrfsFs::default);

        if let Some(used_fragment) = line.split("FS bytes used").nth(1) {
            current_fs.used_bytes = Some(parse_reported_size(used_fragment)?);
            continue;
        }

        if !line.contains(DEVICE_MARKER) {
            continue;
        }

        let Some(path) = line.split_whitespace().last() else {
            continue;
        };

        let size = match token_after(line, "size") {
            Some(value) => parse_reported_size(value)?,
            None => 0,
        };

        current_fs.devices.push((path.to_string(), size));
    }

    if let Some(last) = current {
        filesystems.push(last);
    }

    Ok(filesystems)
}

fn token_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut tokens = line.split_whitespace();
    tokens.find(|token| *token == key)?;
    tokens.next()
}

fn parse_reported_size(value: &str) -> Result<u64> {
    parse_size(value).map_err(|error| SysError::Parse(format!("{value:?}: {error}")))
}

/// Profile handed to `mkfs.btrfs -d` for a pool of `device_count` members.
pub fn topology(device_count: usize) -> Option<RaidProfile> {
    match device_count {
        0 => None,
        1 => Some(RaidProfile::Raid0),
        2 => Some(RaidProfile::Raid1),
        _ => Some(RaidProfile::Raid5),
    }
}

pub struct BtrfsBackend<'a> {
    host: Host<'a>,
}

impl<'a> BtrfsBackend<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self {
            host: Host::new(executor),
        }
    }

    pub fn with_mountinfo(mut self, path: impl Into<PathBuf>) -> Self {
        self.host.mountinfo = path.into();
        self
    }

    fn show(&self, mount_point: &Path) -> Result<Vec<BtrfsFs>> {
        let output = self.host.run(argv([
            "btrfs",
            "filesystem",
            "show",
            "-m",
            &*mount_point.to_string_lossy(),
        ]))?;
        parse_filesystem_show(&output)
    }

    /// Every btrfs filesystem the kernel or a device scan knows about.
    fn filesystems(&self) -> Result<Vec<BtrfsFs>> {
        let output = self.host.run(argv(["btrfs", "filesystem", "show"]))?;
        parse_filesystem_show(&output)
    }

    /// Every device that belongs to any btrfs filesystem on this host.
    fn claimed_devices(&self) -> Result<Vec<String>> {
        Ok(self
            .filesystems()?
            .into_iter()
            .flat_map(|filesystem| filesystem.devices)
            .map(|(path, _)| path)
            .collect())
    }

    fn ensure_unclaimed(&self, devices: &[String]) -> Result<()> {
        let claimed = self.claimed_devices()?;
        if let Some(device) = devices.iter().find(|device| claimed.contains(device)) {
            warn!("{} already holds a btrfs filesystem", device);
            return Err(SysError::DeviceInUse {
                device: device.clone(),
            });
        }
        Ok(())
    }

    /// An unmounted filesystem that owns any of `devices`.
    fn find_unmounted(&self, mount_point: &Path, devices: &[String]) -> Result<Option<StoragePool>> {
        if devices.is_empty() {
            return Ok(None);
        }
        self.ensure_tools()?;

        let Some(filesystem) = self.filesystems()?.into_iter().find(|filesystem| {
            filesystem
                .devices
                .iter()
                .any(|(path, _)| devices.contains(path))
        }) else {
            return Ok(None);
        };

        let members: Vec<String> = filesystem.devices.into_iter().map(|(path, _)| path).collect();
        let table = self.host.mount_table()?;
        if let Some(mounted) = members.iter().find(|member| table.is_source_mounted(member)) {
            warn!("btrfs member {} is mounted elsewhere", mounted);
            return Err(SysError::DeviceInUse {
                device: mounted.clone(),
            });
        }

        info!(
            "Found unmounted btrfs {} on {}",
            filesystem.uuid.as_deref().unwrap_or("filesystem"),
            members.join(", ")
        );
        Ok(Some(StoragePool::new(
            BackendKind::Btrfs,
            mount_point.to_string_lossy(),
            mount_point,
            members,
        )))
    }
}

impl PoolBackend for BtrfsBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Btrfs
    }

    fn topology(&self, device_count: usize) -> Option<RaidProfile> {
        topology(device_count)
    }

    fn ensure_tools(&self) -> Result<()> {
        if !cfg!(feature = "btrfs-tools") {
            return Err(SysError::ToolsNotFound {
                tool: "btrfs".to_string(),
            });
        }
        self.host.ensure_tools(REQUIRED_TOOLS)
    }

    fn create(&self, mount_point: &Path, devices: &[String], force: bool) -> Result<StoragePool> {
        self.ensure_tools()?;
        let devices = creation_devices(devices)?;
        if !force {
            self.host.ensure_unmounted(&devices)?;
            self.ensure_unclaimed(&devices)?;
        }

        let profile = topology(devices.len()).ok_or(SysError::NoDevices)?;
        info!(
            "Creating btrfs {} pool on {} at {:?}",
            profile,
            devices.join(", "),
            mount_point
        );

        let mut command = argv(["mkfs.btrfs", "-f", "-d", profile.as_arg()]);
        command.extend(devices.iter().cloned());
        self.host.run(command)?;

        let pool = StoragePool::new(
            BackendKind::Btrfs,
            mount_point.to_string_lossy(),
            mount_point,
            devices,
        );
        self.mount(&pool)?;
        Ok(pool)
    }

    fn attach(&self, reference: &str) -> Result<StoragePool> {
        let mount_point = Path::new(reference);
        if !mount_point.exists() {
            return Err(SysError::NotFound(reference.to_string()));
        }
        self.ensure_tools()?;

        let mut pool = StoragePool::new(BackendKind::Btrfs, reference, mount_point, Vec::new());
        let devices = self.list_devices(&pool)?;
        if devices.is_empty() {
            return Err(SysError::NotFound(reference.to_string()));
        }
        pool.set_devices(devices);
        Ok(pool)
    }

    fn discover(&self, mount_point: &Path, devices: &[String]) -> Result<Option<StoragePool>> {
        let table = self.host.mount_table()?;
        match table.entry_for(mount_point) {
            Some(entry) if entry.fs_type == "btrfs" => {
                debug!("Found btrfs on {} at {:?}", entry.source, mount_point);
                self.attach(&*mount_point.to_string_lossy()).map(Some)
            }
            _ => self.find_unmounted(mount_point, devices),
        }
    }

    fn add(&self, pool: &mut StoragePool, device: &str) -> Result<AddOutcome> {
        self.ensure_tools()?;

        let members = self.list_devices(pool)?;
        if members.iter().any(|member| member == device) {
            debug!("{} is already a member of {}", device, pool.reference());
            pool.set_devices(members);
            return Ok(AddOutcome::AlreadyMember);
        }

        self.host.ensure_unmounted(&[device.to_string()])?;
        if self.claimed_devices()?.iter().any(|claimed| claimed == device) {
            warn!("{} belongs to another btrfs filesystem", device);
            return Err(SysError::DeviceInUse {
                device: device.to_string(),
            });
        }

        info!("Adding {} to btrfs pool {}", device, pool.reference());
        self.host.run(argv([
            "btrfs",
            "device",
            "add",
            "-f",
            device,
            &*pool.mount_point().to_string_lossy(),
        ]))?;

        pool.set_devices(members);
        pool.push_device(device);

        // New members hold no data until the pool is rebalanced.
        self.rebalance(pool)?;
        Ok(AddOutcome::Added)
    }

    fn mount(&self, pool: &StoragePool) -> Result<()> {
        let mount_point = pool.mount_point();
        self.host.ensure_mount_dir(mount_point)?;

        let table = self.host.mount_table()?;
        if table
            .entry_for(mount_point)
            .is_some_and(|entry| entry.fs_type == "btrfs")
        {
            debug!("{:?} is already mounted", mount_point);
            return Ok(());
        }

        // Any member works; btrfs finds the rest from its metadata.
        let device = pool.devices().first().ok_or(SysError::NoDevices)?;
        info!("Mounting {} at {:?}", device, mount_point);
        self.host
            .run(argv(["mount", device.as_str(), &*mount_point.to_string_lossy()]))?;
        Ok(())
    }

    fn unmount(&self, pool: &StoragePool, force: bool) -> Result<()> {
        let mut command = argv(["umount"]);
        if force {
            command.push("-l".to_string());
        }
        command.push(pool.mount_point().to_string_lossy().to_string());

        info!("Unmounting {:?}", pool.mount_point());
        self.host.run(command)?;
        Ok(())
    }

    fn rebalance(&self, pool: &StoragePool) -> Result<()> {
        info!("Rebalancing btrfs pool {:?}", pool.mount_point());
        self.host.run(argv([
            "btrfs",
            "balance",
            &*pool.mount_point().to_string_lossy(),
        ]))?;
        Ok(())
    }

    fn size(&self, pool: &StoragePool) -> Result<PoolSize> {
        let filesystems = self.show(pool.mount_point())?;
        let filesystem = filesystems
            .into_iter()
            .next()
            .ok_or_else(|| SysError::NotFound(pool.reference().to_string()))?;

        Ok(PoolSize {
            used_bytes: filesystem.used_bytes.unwrap_or(0),
            total_bytes: filesystem.devices.iter().map(|(_, size)| *size).sum(),
        })
    }

    fn list_devices(&self, pool: &StoragePool) -> Result<Vec<String>> {
        Ok(self
            .show(pool.mount_point())?
            .into_iter()
            .flat_map(|filesystem| filesystem.devices)
            .map(|(path, _)| path)
            .collect())
    }
}
