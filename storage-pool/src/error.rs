// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use storage_sys::SysError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Sys(#[from] SysError),
    #[error("config not found: {path:?}")]
    ConfigNotFound { path: PathBuf },
    #[error("invalid config {path:?}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, PoolError>;
