// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for pool operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("required tool not found: {tool}")]
    ToolsNotFound { tool: String },

    #[error("storage pool not found: {0}")]
    NotFound(String),

    #[error("command failed with exit code {exit_code}: {command}; stderr: {stderr}")]
    ToolExecution {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("device is already in use: {device}")]
    DeviceInUse { device: String },

    #[error("no devices supplied")]
    NoDevices,

    #[error("mount point must be an absolute path: {0:?}")]
    InvalidMountPoint(PathBuf),

    #[error("zfs pool has no name")]
    MissingPoolName,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, SysError>;
