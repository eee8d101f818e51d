/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Control plane driver for cloud-hypervisor guests.
//!
//! Launches and talks to one cloud-hypervisor VMM per guest, hands it the
//! guest's network interfaces, places its threads with cgroups, cpu
//! affinity and scheduler policies, and picks running guests up again
//! after a restart.

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(missing_debug_implementations,
    trivial_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
#![warn(clippy::unwrap_used)]

use anyhow::Context;
use clap::Parser;
use config::{ConfigError, DriverConfig};
use context::DriverContext;
use process::ProcessController;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

pub mod cgroups;
pub mod config;
pub mod context;
pub mod guest;
pub mod host;
pub mod jobs;
pub mod logging;
pub mod monitor;
pub mod net;
pub mod placement;
pub mod process;
pub mod reconnect;
pub mod version;

#[cfg(test)]
mod testing;

const EXIT_OKAY: i32 = 0;
const EXIT_ERROR: i32 = 1;

/// Command line options for chd. Anything given here wins over the
/// config file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct ChdOptions {
    /// JSON file with driver settings.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    /// Directory for guest status, sockets and pid files.
    #[clap(long, value_parser)]
    state_dir: Option<PathBuf>,
    /// Directory for VMM logs.
    #[clap(long, value_parser)]
    log_dir: Option<PathBuf>,
    /// The cloud-hypervisor binary.
    #[clap(long, value_parser)]
    vmm_binary: Option<PathBuf>,
    /// Toggle verbosity. Default false
    #[clap(short, long)]
    verbose: bool,
}

impl ChdOptions {
    fn driver_config(&self) -> Result<DriverConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::load(path)?,
            None => DriverConfig::default(),
        };
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(binary) = &self.vmm_binary {
            config.vmm_binary = binary.clone();
        }
        Ok(config)
    }
}

/// Runs the driver until SIGTERM or SIGINT and returns the exit code.
pub async fn daemon() -> i32 {
    let options = ChdOptions::parse();

    if let Err(e) = logging::init(options.verbose) {
        eprintln!("failed to initialize logging: {e}");
        return EXIT_ERROR;
    }

    info!("Starting chd");
    info!("Options: {options:#?}");

    match run(&options).await {
        Ok(()) => EXIT_OKAY,
        Err(e) => {
            error!("{e:?}");
            EXIT_ERROR
        }
    }
}

async fn run(options: &ChdOptions) -> anyhow::Result<()> {
    let config = options.driver_config()?;
    for dir in [&config.state_dir, &config.log_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let ctx = DriverContext::builder(config).build();

    match ctx.launcher().version().await {
        Ok(found) => {
            version::check(found)?;
            info!("Using cloud-hypervisor {}", version::display(found));
        }
        Err(e) => warn!("{e}"),
    }

    let found = reconnect::load_guests(&ctx)?;
    let controller = ProcessController::new(ctx.clone());
    let report = reconnect::reconnect_all(&controller).await;
    info!(
        "{found} persisted guest(s), {} reconnected, {} stopped",
        report.reconnected(),
        report.stopped()
    );

    wait_for_shutdown().await?;

    // guests keep running and are reconnected by the next instance
    info!("Received shutdown signal, leaving {} guest(s) running", ctx.guests().len());
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}
