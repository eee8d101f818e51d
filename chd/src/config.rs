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

use crate::{guest::GuestName, monitor::MonitorPaths};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

/// Settings of one driver instance. Every field has a default, so a config
/// file only names what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Status files, api sockets, event fifos and pid files.
    pub state_dir: PathBuf,
    /// One VMM log per guest.
    pub log_dir: PathBuf,
    pub vmm_binary: PathBuf,
    pub request_timeout_ms: u64,
    pub socket_wait_timeout_ms: u64,
    /// How long a state changing operation waits for the guest's job.
    pub job_wait_ms: u64,
    pub cgroup_parent: String,
    pub stop_cgroup_retries: u32,
    pub stop_cgroup_backoff_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/run/chd"),
            log_dir: PathBuf::from("/var/log/chd"),
            vmm_binary: PathBuf::from("cloud-hypervisor"),
            request_timeout_ms: 30_000,
            socket_wait_timeout_ms: 10_000,
            job_wait_ms: 30_000,
            cgroup_parent: "machine.slice".into(),
            stop_cgroup_retries: 5,
            stop_cgroup_backoff_ms: 200,
        }
    }
}

impl DriverConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn socket_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_wait_timeout_ms)
    }

    pub fn job_wait(&self) -> Duration {
        Duration::from_millis(self.job_wait_ms)
    }

    pub fn stop_cgroup_backoff(&self) -> Duration {
        Duration::from_millis(self.stop_cgroup_backoff_ms)
    }

    pub fn monitor_paths(&self, guest: &GuestName) -> MonitorPaths {
        MonitorPaths::new(&self.state_dir, &self.log_dir, guest)
    }
}
