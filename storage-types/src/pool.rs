// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Filesystem family that realizes a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Btrfs,
    Zfs,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Btrfs => "btrfs",
            BackendKind::Zfs => "zfs",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "btrfs" => Ok(BackendKind::Btrfs),
            "zfs" => Ok(BackendKind::Zfs),
            other => Err(anyhow::anyhow!(
                "unknown storage backend '{}': expected 'btrfs' or 'zfs'",
                other
            )),
        }
    }
}

/// Redundancy scheme passed to the backend tool at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    Raid0,
    Raid1,
    Raid5,
    Raidz,
}

impl RaidProfile {
    /// Argument spelling understood by `mkfs.btrfs -d` and `zpool create`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            RaidProfile::Raid0 => "raid0",
            RaidProfile::Raid1 => "raid1",
            RaidProfile::Raid5 => "raid5",
            RaidProfile::Raidz => "raidz",
        }
    }
}

impl fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Capacity snapshot, normalized to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolSize {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl PoolSize {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Result of extending a pool with one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Added,
    AlreadyMember,
}

/// Serializable view of a pool handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub backend: BackendKind,
    /// Mount path for btrfs, pool name for zfs.
    pub reference: String,
    pub mount_point: PathBuf,
    pub devices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<PoolSize>,
}
