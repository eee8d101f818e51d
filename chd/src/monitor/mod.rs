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

//! Control sessions with cloud-hypervisor VMMs.
//!
//! A [MonitorHandle] is one session: REST requests over the VMM's api
//! socket, a background reader on its event monitor fifo and the last
//! known set of VMM threads.

pub use api::{ApiClient, Endpoint, ResizeConfig, VmConfig, API_ROOT};
pub use error::{MonitorError, Result};
pub use events::{Event, EventDecoder, VmmEvent};
pub use info::{VmInfo, VmState};
pub use launcher::{CloudHypervisorLauncher, LaunchSpec, VmmLauncher};
pub use threads::{
    classify, IoThreadInfo, ProcfsThreads, ThreadKind, ThreadLister,
    ThreadRecord,
};

use crate::{
    context::DriverContext,
    guest::{Guest, GuestDef, GuestName},
};
use anyhow::anyhow;
use events::EventStream;
use nix::{
    sys::{signal::{kill, Signal}, stat::Mode},
    unistd::Pid,
};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub mod error;

mod api;
mod events;
mod info;
mod launcher;
mod threads;

const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Where one guest's VMM keeps its control files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorPaths {
    pub socket: PathBuf,
    pub event_fifo: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl MonitorPaths {
    pub fn new(state_dir: &Path, log_dir: &Path, guest: &GuestName) -> Self {
        Self {
            socket: state_dir.join(format!("{guest}.sock")),
            event_fifo: state_dir.join(format!("{guest}.events")),
            pid_file: state_dir.join(format!("{guest}.pid")),
            log_file: log_dir.join(format!("{guest}.log")),
        }
    }
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            warn!("failed to remove {}: {e}", path.display())
        }
        _ => {}
    }
}

#[derive(Debug)]
pub struct MonitorHandle {
    guest: GuestName,
    api: ApiClient,
    paths: MonitorPaths,
    pid: Pid,
    lister: Arc<dyn ThreadLister>,
    snapshot: RwLock<Vec<ThreadRecord>>,
    events: tokio::sync::Mutex<Option<EventStream>>,
    forward: broadcast::Sender<VmmEvent>,
    // set by close or by a failed event read
    closed: Arc<AtomicBool>,
    released: AtomicBool,
}

impl MonitorHandle {
    fn assemble(
        ctx: &DriverContext,
        guest: &Guest,
        paths: MonitorPaths,
        pid: Pid,
        forward: broadcast::Sender<VmmEvent>,
        events: Option<EventStream>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            guest: guest.name().clone(),
            api: ApiClient::new(&paths.socket, ctx.config().request_timeout()),
            paths,
            pid,
            lister: ctx.thread_lister(),
            snapshot: RwLock::new(vec![]),
            events: tokio::sync::Mutex::new(events),
            forward,
            closed,
            released: AtomicBool::new(false),
        }
    }

    /// Connects to the VMM of a guest that is already running.
    pub async fn open(ctx: &DriverContext, guest: &Guest) -> Result<Self> {
        let paths = ctx.config().monitor_paths(guest.name());
        let pid = guest.pid().ok_or_else(|| MonitorError::Connection {
            socket: paths.socket.clone(),
            source: anyhow!("guest has no VMM process"),
        })?;

        let (forward, _) = broadcast::channel(16);
        let closed = Arc::new(AtomicBool::new(false));
        let handle = Self::assemble(ctx, guest, paths, pid, forward, None, closed);
        handle.ping().await?;

        if handle.paths.event_fifo.exists() {
            match EventStream::start(
                &handle.paths.event_fifo,
                handle.guest.clone(),
                guest.state_cell(),
                handle.forward.clone(),
                handle.closed.clone(),
            ) {
                Ok(stream) => *handle.events.lock().await = Some(stream),
                Err(e) => warn!("guest '{}' runs without events: {e}", handle.guest),
            }
        } else {
            warn!("guest '{}' has no event monitor fifo", handle.guest);
        }

        info!("reconnected to VMM of guest '{}' (pid {pid})", handle.guest);
        Ok(handle)
    }

    /// Launches a new VMM for the guest and connects to it.
    pub async fn new(ctx: &DriverContext, guest: &Guest) -> Result<Self> {
        let paths = ctx.config().monitor_paths(guest.name());
        let launch_err = |source: anyhow::Error| MonitorError::Launch { source };

        if let Some(dir) = paths.event_fifo.parent() {
            std::fs::create_dir_all(dir).map_err(|e| launch_err(e.into()))?;
        }
        remove_if_present(&paths.event_fifo);
        nix::unistd::mkfifo(&paths.event_fifo, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| launch_err(e.into()))?;

        // the reader must exist before the VMM opens the fifo for writing
        let (forward, _) = broadcast::channel(16);
        let closed = Arc::new(AtomicBool::new(false));
        let stream = EventStream::start(
            &paths.event_fifo,
            guest.name().clone(),
            guest.state_cell(),
            forward.clone(),
            closed.clone(),
        )?;

        let spec = LaunchSpec {
            guest: guest.name().clone(),
            socket: paths.socket.clone(),
            event_fifo: paths.event_fifo.clone(),
            pid_file: paths.pid_file.clone(),
            log_file: paths.log_file.clone(),
        };
        let pid = match ctx.launcher().launch(&spec).await {
            Ok(pid) => pid,
            Err(source) => {
                stream.stop().await;
                remove_if_present(&paths.event_fifo);
                return Err(MonitorError::Launch { source });
            }
        };

        let handle =
            Self::assemble(ctx, guest, paths, pid, forward, Some(stream), closed);
        if let Err(e) = handle.ping().await {
            handle.close().await;
            return Err(e);
        }

        info!("started VMM of guest '{}' (pid {pid})", handle.guest);
        Ok(handle)
    }

    async fn ping(&self) -> Result<()> {
        self.api.call(Endpoint::VmmPing, None).await.map(|_| ()).map_err(
            |e| match e {
                e @ MonitorError::Connection { .. } => e,
                other => MonitorError::Connection {
                    socket: self.paths.socket.clone(),
                    source: other.into(),
                },
            },
        )
    }

    pub fn guest(&self) -> &GuestName {
        &self.guest
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn paths(&self) -> &MonitorPaths {
        &self.paths
    }

    pub fn socket(&self) -> &Path {
        self.api.socket()
    }

    /// Device and cpu events of this VMM.
    pub fn subscribe(&self) -> broadcast::Receiver<VmmEvent> {
        self.forward.subscribe()
    }

    pub async fn create_vm(&self, def: &GuestDef) -> Result<()> {
        let _ = self.api.put_json(Endpoint::VmCreate, &VmConfig::from(def)).await?;
        Ok(())
    }

    pub async fn boot_vm(&self) -> Result<()> {
        self.invalidate_threads();
        let _ = self.api.call(Endpoint::VmBoot, None).await?;
        Ok(())
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        let _ = self.api.call(Endpoint::VmShutdown, None).await?;
        Ok(())
    }

    pub async fn reboot_vm(&self) -> Result<()> {
        self.invalidate_threads();
        let _ = self.api.call(Endpoint::VmReboot, None).await?;
        Ok(())
    }

    pub async fn suspend_vm(&self) -> Result<()> {
        let _ = self.api.call(Endpoint::VmPause, None).await?;
        Ok(())
    }

    pub async fn resume_vm(&self) -> Result<()> {
        let _ = self.api.call(Endpoint::VmResume, None).await?;
        Ok(())
    }

    pub async fn delete_vm(&self) -> Result<()> {
        let _ = self.api.call(Endpoint::VmDelete, None).await?;
        Ok(())
    }

    /// Asks the VMM for `vcpus` vcpus. The count is checked by the VMM only.
    pub async fn resize_cpu(&self, vcpus: u32) -> Result<()> {
        let body = ResizeConfig { desired_vcpus: vcpus };
        let _ = self.api.put_json(Endpoint::VmResize, &body).await?;
        Ok(())
    }

    pub async fn get_info(&self) -> Result<VmInfo> {
        let body = self.api.call(Endpoint::VmInfo, None).await?;
        serde_json::from_slice(&body).map_err(|e| MonitorError::Decode {
            endpoint: Endpoint::VmInfo.name(),
            source: e.into(),
        })
    }

    /// Re-reads the VMM's threads and replaces the snapshot. Zero means the
    /// VMM has no threads to report yet.
    pub fn refresh_thread_info(&self) -> Result<usize> {
        let threads = self
            .lister
            .threads(self.pid)
            .map_err(|source| MonitorError::Threads { source })?;

        let records: Vec<ThreadRecord> = threads
            .into_iter()
            .map(|(tid, name)| ThreadRecord { tid, kind: classify(&name) })
            .collect();
        debug!("guest '{}' has {} VMM threads", self.guest, records.len());

        let count = records.len();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = records;
        Ok(count)
    }

    pub fn thread_info(&self, refresh: bool) -> Result<Vec<ThreadRecord>> {
        if refresh {
            let _ = self.refresh_thread_info()?;
        }
        Ok(self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn io_threads(&self) -> Vec<IoThreadInfo> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|record| match &record.kind {
                ThreadKind::IoThread { name } => Some(IoThreadInfo {
                    tid: record.tid,
                    name: name.clone(),
                    cpumask: self.lister.affinity(record.tid),
                }),
                _ => None,
            })
            .collect()
    }

    /// Threads do not survive a boot or reboot of the guest.
    pub fn invalidate_threads(&self) {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Whether the session ended, through [Self::close] or because its
    /// event monitor could no longer be read.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ends the session and the VMM process behind it. Later calls do
    /// nothing. A session already closed by its event reader still has its
    /// VMM released here.
    pub async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing monitor of guest '{}'", self.guest);
        }

        if let Some(stream) = self.events.lock().await.take() {
            stream.stop().await;
        }

        if process_alive(self.pid) {
            if let Err(e) = self.api.call(Endpoint::VmmShutdown, None).await {
                debug!("vmm.shutdown of guest '{}' failed: {e}", self.guest);
            }
            self.terminate().await;
        }

        remove_if_present(&self.paths.socket);
        remove_if_present(&self.paths.event_fifo);
        self.invalidate_threads();
        debug!("closed monitor of guest '{}'", self.guest);
    }

    async fn terminate(&self) {
        let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
        let mut signalled = false;
        while process_alive(self.pid) {
            if tokio::time::Instant::now() >= deadline {
                warn!("VMM {} of guest '{}' ignored SIGTERM", self.pid, self.guest);
                let _ = kill(self.pid, Signal::SIGKILL);
                return;
            }
            if !signalled {
                let _ = kill(self.pid, Signal::SIGTERM);
                signalled = true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn process_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}
