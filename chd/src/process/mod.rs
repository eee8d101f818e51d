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

//! Guest lifecycle on top of the monitor, network, cgroup and placement
//! layers.
//!
//! ```text
//! NotCreated -> start -> Booting -> Running -> stop -> ShutOff
//! Running -> suspend -> Paused -> resume -> Running
//! ```
//!
//! Every operation runs under the guest's job. A failed start always ends
//! in a stop with [StateReason::Failed], so no guest is left half started.

pub use error::{ProcessError, Result};

use crate::{
    cgroups::{CgroupsError, Controller},
    context::DriverContext,
    guest::{CpuMask, Guest, GuestDef, RunState, StateReason},
    jobs::JobGuard,
    monitor::MonitorHandle,
    placement::PlacementError,
};
use nix::unistd::Pid;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod error;

mod threads;

#[derive(Debug, Clone)]
pub struct ProcessController {
    ctx: Arc<DriverContext>,
}

impl ProcessController {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    async fn job(&self, guest: &Guest) -> Result<JobGuard> {
        Ok(self.ctx.jobs().acquire(guest.name(), self.ctx.config().job_wait()).await?)
    }

    fn monitor_of(&self, guest: &Guest) -> Result<Arc<MonitorHandle>> {
        guest
            .monitor()
            .ok_or_else(|| ProcessError::NotActive { name: guest.name().clone() })
    }

    fn save(&self, guest: &Guest) -> Result<()> {
        Ok(self.ctx.status().save(&guest.record())?)
    }

    /// Starts the guest's VMM, hands it the guest's interfaces, boots the
    /// guest and places its threads.
    pub async fn start(&self, guest: &Guest, reason: StateReason) -> Result<()> {
        let _job = self.job(guest).await?;
        if guest.is_active() {
            return Err(ProcessError::AlreadyActive { name: guest.name().clone() });
        }

        let def = guest.def();
        self.ctx
            .host_devices()
            .prepare(guest.name(), &def)
            .map_err(|source| ProcessError::HostDevices {
                name: guest.name().clone(),
                source,
            })?;

        match self.launch_and_boot(guest, &def, reason).await {
            Ok(()) => {
                info!("guest '{}' is running", guest.name());
                Ok(())
            }
            Err(e) => {
                error!("failed to start guest '{}': {e}", guest.name());
                self.teardown(guest, StateReason::Failed).await;
                Err(e)
            }
        }
    }

    async fn launch_and_boot(
        &self,
        guest: &Guest,
        def: &GuestDef,
        reason: StateReason,
    ) -> Result<()> {
        let name = guest.name();
        let monitor = match guest.monitor() {
            Some(monitor) => monitor,
            None => {
                let monitor = Arc::new(MonitorHandle::new(&self.ctx, guest).await?);
                guest.set_pid(Some(monitor.pid()));
                guest.set_monitor(monitor.clone());
                monitor.create_vm(def).await?;
                monitor
            }
        };

        let nic_indexes =
            self.ctx.network().attach(monitor.socket(), &def.nets).await?;
        self.ctx.cgroups().setup_guest(name, monitor.pid(), &nic_indexes)?;
        self.init_affinity(guest, def, monitor.pid())?;
        self.ctx.network().links_up(&def.nets).await?;

        guest.set_state(RunState::Booting, reason);
        monitor.boot_vm().await?;

        let count = monitor.refresh_thread_info()?;
        debug!("guest '{name}' booted with {count} VMM threads");
        self.update_info(guest, &monitor).await?;

        self.place_threads(guest, def, &monitor, count)?;
        self.apply_global_bandwidth(guest, def)?;

        guest.set_state(RunState::Running, reason);
        self.save(guest)
    }

    /// Places the threads of the last refresh. A VMM that reports no
    /// threads yet is left alone until a later refresh.
    fn place_threads(
        &self,
        guest: &Guest,
        def: &GuestDef,
        monitor: &MonitorHandle,
        count: usize,
    ) -> Result<()> {
        if count == 0 {
            debug!("guest '{}' has no VMM threads yet, not placing", guest.name());
            return Ok(());
        }
        let snapshot = monitor.thread_info(false)?;
        Ok(threads::place_threads(self.ctx.placer(), guest.name(), def, &snapshot)?)
    }

    /// Affinity for the whole VMM process until its threads are placed.
    fn init_affinity(&self, guest: &Guest, def: &GuestDef, pid: Pid) -> Result<()> {
        let affinity_err = |source| ProcessError::Affinity {
            name: guest.name().clone(),
            source,
        };

        let mask: CpuMask = match def.strict_nodeset() {
            Some(nodes) if def.numa_cells <= 1 => {
                self.ctx.numa().nodeset_cpus(nodes).map_err(affinity_err)?
            }
            _ => match &def.cputune.emulatorpin {
                Some(pin) => pin.clone(),
                None => self.ctx.cpus().online().map_err(affinity_err)?,
            },
        };
        self.ctx.cpus().set_affinity(pid, &mask).map_err(affinity_err)
    }

    fn apply_global_bandwidth(&self, guest: &Guest, def: &GuestDef) -> Result<()> {
        let tune = &def.cputune;
        let period = tune.global_period.filter(|p| *p != 0);
        let quota = tune.global_quota.filter(|q| *q != 0);
        if period.is_none() && quota.is_none() {
            return Ok(());
        }
        if !self.ctx.cgroups().has_controller(guest.name(), Controller::Cpu) {
            return Err(PlacementError::Unsupported { what: "cpu bandwidth" }.into());
        }
        Ok(self.ctx.cgroups().set_bandwidth(guest.name(), None, period, quota)?)
    }

    /// Resyncs console paths and run state with what the VMM reports.
    async fn update_info(&self, guest: &Guest, monitor: &MonitorHandle) -> Result<()> {
        let info = monitor.get_info().await?;
        guest.set_consoles(info.consoles());
        guest.state_cell().set_state(info.run_state());
        Ok(())
    }

    /// Stops the guest. Only waiting for the guest's job can fail, the
    /// teardown itself always completes.
    pub async fn stop(&self, guest: &Guest, reason: StateReason) -> Result<()> {
        let _job = self.job(guest).await?;
        self.teardown(guest, reason).await;
        Ok(())
    }

    /// Releases everything the guest holds and marks it shut off. Safe to
    /// repeat, including after an interrupted earlier run.
    pub(crate) async fn teardown(&self, guest: &Guest, reason: StateReason) {
        let name = guest.name();

        if let Some(monitor) = guest.take_monitor() {
            monitor.close().await;
        }

        if let Err(e) = self.ctx.host_devices().reattach(name, &guest.def()) {
            warn!("failed to reattach host devices of guest '{name}': {e:#}");
        }

        if let Err(e) = self.remove_cgroup(guest).await {
            warn!("leaving cgroup of guest '{name}' behind: {e}");
        }

        guest.set_pid(None);
        guest.set_consoles(Default::default());
        if let Err(e) = self.ctx.status().remove(name) {
            warn!("{e}");
        }

        guest.set_state(RunState::ShutOff, reason);
        info!("guest '{name}' is shut off ({reason:?})");
    }

    /// Removes the guest cgroup, retrying while exiting tasks keep it busy.
    async fn remove_cgroup(&self, guest: &Guest) -> std::result::Result<(), CgroupsError> {
        let config = self.ctx.config();
        let mut retries = 0;
        loop {
            match self.ctx.cgroups().remove_guest(guest.name()) {
                Err(CgroupsError::Busy { .. })
                    if retries < config.stop_cgroup_retries =>
                {
                    retries += 1;
                    debug!(
                        "cgroup of guest '{}' is busy, retry {retries}",
                        guest.name()
                    );
                    tokio::time::sleep(config.stop_cgroup_backoff()).await;
                }
                result => return result,
            }
        }
    }

    pub async fn suspend(&self, guest: &Guest) -> Result<()> {
        let _job = self.job(guest).await?;
        let monitor = self.monitor_of(guest)?;
        monitor.suspend_vm().await?;
        guest.set_state(RunState::Paused, StateReason::User);
        self.save(guest)
    }

    pub async fn resume(&self, guest: &Guest) -> Result<()> {
        let _job = self.job(guest).await?;
        let monitor = self.monitor_of(guest)?;
        monitor.resume_vm().await?;
        guest.set_state(RunState::Running, StateReason::Unpaused);
        self.save(guest)
    }

    /// Asks the guest to shut down. The VMM reports completion through its
    /// events, stopping the guest is left to the caller.
    pub async fn shutdown(&self, guest: &Guest) -> Result<()> {
        let _job = self.job(guest).await?;
        let monitor = self.monitor_of(guest)?;
        monitor.shutdown_vm().await?;
        guest.set_state(RunState::ShuttingDown, StateReason::User);
        self.save(guest)
    }

    pub async fn reboot(&self, guest: &Guest) -> Result<()> {
        let _job = self.job(guest).await?;
        let monitor = self.monitor_of(guest)?;
        monitor.reboot_vm().await?;

        let def = guest.def();
        let count = monitor.refresh_thread_info()?;
        self.place_threads(guest, &def, &monitor, count)?;
        guest.set_state(RunState::Running, StateReason::Booted);
        self.save(guest)
    }

    /// Resizes the guest to `vcpus` online vcpus and places the new vcpu
    /// threads. The count is validated by the VMM.
    pub async fn set_vcpus(&self, guest: &Guest, vcpus: u32) -> Result<()> {
        let _job = self.job(guest).await?;
        let monitor = self.monitor_of(guest)?;
        monitor.resize_cpu(vcpus).await?;

        guest.update_def(|def| {
            for vcpu in def.vcpus.iter_mut() {
                vcpu.online = vcpu.id < vcpus;
            }
        });
        let def = guest.def();
        let count = monitor.refresh_thread_info()?;
        self.place_threads(guest, &def, &monitor, count)?;
        self.save(guest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        guest::{GuestName, GuestState},
        host::{FileStatusStore, StatusStore, VfioHostDevices},
        testing::{RecordingCgroups, RecordingCpus, RecordingPlacer, StaticNuma},
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        cgroups: Arc<RecordingCgroups>,
        status: Arc<FileStatusStore>,
        controller: ProcessController,
    }

    fn fixture(cgroups: RecordingCgroups) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DriverConfig {
            state_dir: dir.path().to_path_buf(),
            log_dir: dir.path().to_path_buf(),
            stop_cgroup_backoff_ms: 1,
            job_wait_ms: 100,
            ..Default::default()
        };
        let cgroups = Arc::new(cgroups);
        let status = Arc::new(FileStatusStore::new(dir.path()));
        let ctx = DriverContext::builder(config)
            .cgroups(cgroups.clone())
            .cpus(Arc::new(RecordingCpus::new("0-7")))
            .numa(Arc::new(StaticNuma))
            .status(status.clone())
            .host_devices(Arc::new(VfioHostDevices::new(dir.path().join("pci"))))
            .placer(Arc::new(RecordingPlacer::default()))
            .build();
        Fixture { _dir: dir, cgroups, status, controller: ProcessController::new(ctx) }
    }

    fn running_guest() -> Guest {
        let guest = Guest::new(GuestName::new("vm0"), GuestDef::default());
        guest.set_pid(Some(Pid::from_raw(4242)));
        guest.set_state(RunState::Running, StateReason::Booted);
        guest
    }

    #[tokio::test]
    async fn stop_twice_ends_in_the_same_state() {
        let fx = fixture(RecordingCgroups::default());
        let guest = running_guest();
        fx.status.save(&guest.record()).expect("saved");

        fx.controller.stop(&guest, StateReason::Destroyed).await.expect("first");
        let first = guest.state();
        fx.controller.stop(&guest, StateReason::Destroyed).await.expect("second");

        assert_eq!(first, GuestState::new(RunState::ShutOff, StateReason::Destroyed));
        assert_eq!(guest.state(), first);
        assert_eq!(guest.pid(), None);
        assert!(fx.status.load_all().expect("load").is_empty());
    }

    #[tokio::test]
    async fn busy_cgroups_are_retried() {
        let fx = fixture(RecordingCgroups::default().busy_for(3));
        let guest = running_guest();

        fx.controller.stop(&guest, StateReason::Destroyed).await.expect("stop");

        let removals =
            fx.cgroups.calls().iter().filter(|c| *c == "remove-guest vm0").count();
        assert_eq!(removals, 4);
    }

    #[tokio::test]
    async fn a_cgroup_that_stays_busy_does_not_fail_stop() {
        let fx = fixture(RecordingCgroups::default().busy_for(100));
        let guest = running_guest();

        fx.controller.stop(&guest, StateReason::Shutdown).await.expect("stop");

        let removals =
            fx.cgroups.calls().iter().filter(|c| *c == "remove-guest vm0").count();
        assert_eq!(removals, 6);
        assert_eq!(guest.state().state, RunState::ShutOff);
    }

    #[tokio::test]
    async fn failing_host_devices_abort_before_any_vmm_exists() {
        let fx = fixture(RecordingCgroups::default());
        let def = GuestDef {
            host_devices: vec!["0000:42:00.0".into()],
            ..Default::default()
        };
        let guest = Guest::new(GuestName::new("vm0"), def);
        // the scratch sysfs has no such device
        let err = fx
            .controller
            .start(&guest, StateReason::Booted)
            .await
            .expect_err("device cannot be prepared");

        assert!(matches!(err, ProcessError::HostDevices { .. }), "{err}");
        assert_eq!(guest.state().state, RunState::NotCreated);
        assert!(guest.monitor().is_none());
        assert!(fx.cgroups.calls().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_requests_need_a_running_guest() {
        let fx = fixture(RecordingCgroups::default());
        let guest = Guest::new(GuestName::new("vm0"), GuestDef::default());

        assert!(matches!(
            fx.controller.suspend(&guest).await,
            Err(ProcessError::NotActive { .. })
        ));
        assert!(matches!(
            fx.controller.set_vcpus(&guest, 2).await,
            Err(ProcessError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn a_held_job_makes_start_busy() {
        let fx = fixture(RecordingCgroups::default());
        let guest = Guest::new(GuestName::new("vm0"), GuestDef::default());
        let _held = fx
            .controller
            .context()
            .jobs()
            .acquire(guest.name(), std::time::Duration::from_secs(1))
            .await
            .expect("job");

        let err = fx
            .controller
            .start(&guest, StateReason::Booted)
            .await
            .expect_err("busy");
        assert!(matches!(err, ProcessError::Job(_)), "{err}");
    }
}
