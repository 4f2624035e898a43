// SPDX-License-Identifier: GPL-3.0-only

//! Low-level pool operations driven through volume-management binaries
//!
//! This crate provides:
//! - A command executor that runs `mkfs.btrfs`, `btrfs`, `mount`, `umount`,
//!   `zpool` and `zfs` and captures their output
//! - A reader for the kernel mount table
//! - The pool backend contract and its btrfs and zfs implementations
//!
//! Calls are synchronous and expect the caller to serialize access per host.
//! These operations require elevated privileges.

pub mod cmd;
pub mod error;
pub mod mounts;
pub mod pool;

pub use cmd::{CommandExecutor, CommandOutput, DryRunExecutor, RecordingExecutor, SystemExecutor};
pub use error::{Result, SysError};
pub use mounts::{MountEntry, MountTable};
pub use pool::{Backend, BtrfsBackend, PoolBackend, StoragePool, ZfsBackend};
