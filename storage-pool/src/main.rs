// SPDX-License-Identifier: GPL-3.0-only

//! Command-line front end for the storage pool registry

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use storage_pool::{PoolConfig, PoolRegistry};
use storage_sys::{CommandExecutor, DryRunExecutor, PoolBackend, SystemExecutor};
use storage_types::{BackendKind, bytes_to_pretty};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_CONFIG: &str = "/etc/storage-pool.toml";

/// Create, extend and mount btrfs or zfs pools
#[derive(Debug, Parser)]
#[command(name = "storage-pool")]
#[command(about = "Manage multi-device btrfs/zfs pools backing a data directory", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend to use, overrides the configuration
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Mount point of the pool, overrides the configuration
    #[arg(long, global = true)]
    mount_point: Option<PathBuf>,

    /// Use devices even if they are mounted elsewhere
    #[arg(long, global = true)]
    force: bool,

    /// Print the commands that would change pools instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extend the existing pool with the devices, or create one from them
    Provision {
        /// Block devices, e.g. /dev/sdb
        devices: Vec<String>,
    },
    /// Format the devices into a new pool (destroys their contents)
    Create {
        #[arg(required = true)]
        devices: Vec<String>,
    },
    /// Show the existing pool
    Attach,
    /// Add a device to the existing pool
    Add { device: String },
    /// Mount the existing pool
    Mount,
    /// Unmount the existing pool
    Unmount {
        /// Detach even if the filesystem is busy
        #[arg(long)]
        force: bool,
    },
    /// Redistribute data across all members
    Rebalance,
    /// Report used and total capacity
    Size,
    /// List member devices as reported by the backend
    Devices,
}

impl Commands {
    fn mutates(&self) -> bool {
        !matches!(
            self,
            Commands::Attach | Commands::Size | Commands::Devices
        )
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "storage_pool=debug,storage_sys=debug"
    } else {
        "storage_pool=info,storage_sys=info"
    };

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<PoolConfig> {
    let mut config = match &cli.config {
        Some(path) => PoolConfig::load(path)?,
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                PoolConfig::load(&path)?
            } else {
                PoolConfig::default()
            }
        }
    };

    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(mount_point) = &cli.mount_point {
        config.mount_point = mount_point.clone();
    }
    if cli.force {
        config.force = true;
    }

    config.validate()?;
    Ok(config)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn run(cli: &Cli, config: PoolConfig, executor: &dyn CommandExecutor) -> Result<()> {
    let registry = PoolRegistry::new(config, executor);
    let backend = registry.backend();

    match &cli.command {
        Commands::Provision { devices } => {
            let provisioned = registry.provision(devices)?;
            print_json(&json!({
                "previous": provisioned.previous,
                "added": provisioned.added,
                "pool": provisioned.pool.info(None),
            }))?;
        }
        Commands::Create { devices } => {
            let config = registry.config();
            let pool = backend.create(&config.mount_point, devices, config.force)?;
            print_json(&json!(pool.info(None)))?;
        }
        Commands::Attach => {
            let pool = registry.open()?;
            print_json(&json!(pool.info(None)))?;
        }
        Commands::Add { device } => {
            let mut pool = registry.open()?;
            let outcome = backend.add(&mut pool, device)?;
            print_json(&json!({ "outcome": outcome, "pool": pool.info(None) }))?;
        }
        Commands::Mount => {
            let pool = registry.open()?;
            backend.mount(&pool)?;
            print_json(&json!({ "success": true }))?;
        }
        Commands::Unmount { force } => {
            let pool = registry.open()?;
            backend.unmount(&pool, *force)?;
            print_json(&json!({ "success": true }))?;
        }
        Commands::Rebalance => {
            let pool = registry.open()?;
            backend.rebalance(&pool)?;
            print_json(&json!({ "success": true }))?;
        }
        Commands::Size => {
            let pool = registry.open()?;
            let size = backend.size(&pool)?;
            tracing::info!(
                "{} used of {}, {} free",
                bytes_to_pretty(&size.used_bytes, false),
                bytes_to_pretty(&size.total_bytes, true),
                bytes_to_pretty(&size.free_bytes(), false)
            );
            print_json(&json!(pool.info(Some(size))))?;
        }
        Commands::Devices => {
            let pool = registry.open()?;
            print_json(&json!(backend.list_devices(&pool)?))?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli).context("failed to load pool configuration")?;
    tracing::debug!("Using {:?}", config);

    if cli.dry_run {
        // Queries still run so decisions match a real invocation.
        let executor = DryRunExecutor::new(SystemExecutor);
        let result = run(&cli, config, &executor);
        for command in executor.rendered_calls() {
            println!("{}", command);
        }
        return result;
    }

    if cli.command.mutates() && unsafe { libc::geteuid() } != 0 {
        tracing::error!("storage-pool must run as root to change pools");
        anyhow::bail!("Command requires root privileges");
    }

    run(&cli, config, &SystemExecutor)
}
