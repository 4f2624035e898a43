// SPDX-License-Identifier: GPL-3.0-only

//! Entry point used by orchestration glue once block devices are attached
//!
//! Given a configured backend and a list of devices, the registry either
//! extends the pool already mounted at the well-known path or creates a new
//! one. Configuration is loaded once at startup and passed in explicitly.

pub mod config;
pub mod error;
pub mod registry;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use registry::{PoolRegistry, PoolState, Provisioned};
