// SPDX-License-Identifier: GPL-3.0-only

//! Canonical models for multi-device storage pools
//!
//! These types are shared by the backend layer and its callers:
//!
//! - **storage-sys**: returns these types from the btrfs and zfs backends
//! - **storage-pool**: selects a backend from configuration and serializes
//!   these types as the command-line output
//!
//! Pool membership and capacity are never cached here; every value is a
//! snapshot of what the backend tool reported at the time of the query.

pub mod common;
pub mod pool;

pub use common::{bytes_to_pretty, parse_size};
pub use pool::{AddOutcome, BackendKind, PoolInfo, PoolSize, RaidProfile};
