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

use crate::{guest::GuestName, version::{self, VersionError}};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use nix::unistd::Pid;
use std::{
    fmt::Debug,
    fs::OpenOptions,
    io::ErrorKind,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};
use tokio::{net::UnixStream, process::Command};
use tracing::{debug, info, warn};

/// Paths a freshly launched VMM is told to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub guest: GuestName,
    pub socket: PathBuf,
    pub event_fifo: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

/// Starts VMM processes.
#[async_trait]
pub trait VmmLauncher: Debug + Send + Sync {
    /// Starts a VMM and returns once its api socket accepts connections.
    /// A VMM that was spawned but never became reachable is killed again.
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Pid>;

    /// The encoded version of the VMM binary.
    async fn version(&self) -> Result<u64, VersionError>;
}

#[derive(Debug, Clone)]
pub struct CloudHypervisorLauncher {
    binary: PathBuf,
    socket_wait: Duration,
}

impl CloudHypervisorLauncher {
    pub fn new(binary: impl Into<PathBuf>, socket_wait: Duration) -> Self {
        Self { binary: binary.into(), socket_wait }
    }
}

#[async_trait]
impl VmmLauncher for CloudHypervisorLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Pid> {
        match std::fs::remove_file(&spec.socket) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                return Err(e).context("failed to remove stale api socket")
            }
            _ => {}
        }

        if let Some(dir) = spec.log_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .with_context(|| {
                format!("failed to open {}", spec.log_file.display())
            })?;

        let mut child = Command::new(&self.binary)
            .arg("--api-socket")
            .arg(format!("path={}", spec.socket.display()))
            .arg("--event-monitor")
            .arg(format!("path={}", spec.event_fifo.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            // a driver restart must not take the VMM with it
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| anyhow!("VMM exited right after spawn"))?;
        debug!("guest '{}' VMM spawned with pid {pid}", spec.guest);

        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(self.socket_wait))
            .build();

        let ready = loop {
            if let Some(status) = child.try_wait()? {
                break Err(anyhow!(
                    "VMM exited with {status} before its api socket appeared"
                ));
            }
            if UnixStream::connect(&spec.socket).await.is_ok() {
                break Ok(());
            }
            match backoff.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    break Err(anyhow!(
                        "api socket {} did not appear within {:?}",
                        spec.socket.display(),
                        self.socket_wait
                    ))
                }
            }
        };

        if let Err(e) = ready {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        if let Err(e) = std::fs::write(&spec.pid_file, pid.to_string()) {
            warn!("failed to write pid file {}: {e}", spec.pid_file.display());
        }

        // reap the VMM whenever it exits
        let guest = spec.guest.clone();
        let _reaper = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("guest '{guest}' VMM exited with {status}"),
                Err(e) => warn!("failed to wait for VMM of guest '{guest}': {e}"),
            }
        });

        Ok(pid)
    }

    async fn version(&self) -> Result<u64, VersionError> {
        version::probe(&self.binary).await
    }
}
