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

//! Picks up guests whose VMMs outlived a previous driver instance.

use crate::{
    context::DriverContext,
    guest::{Guest, GuestName, GuestState, StateReason},
    host::StatusError,
    monitor::MonitorHandle,
    process::{ProcessController, ProcessError, Result},
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How reconnecting one guest ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Managed again, in the state the VMM reported.
    Reconnected(GuestState),
    /// The guest could not be managed again, or was already going down, and
    /// has been stopped.
    Stopped { reason: String },
}

#[derive(Debug, Default)]
pub struct ReconnectReport {
    pub outcomes: Vec<(GuestName, ReconnectOutcome)>,
}

impl ReconnectReport {
    pub fn reconnected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ReconnectOutcome::Reconnected(_)))
            .count()
    }

    pub fn stopped(&self) -> usize {
        self.outcomes.len() - self.reconnected()
    }
}

/// Adds every persisted guest to the guest list and returns how many were
/// found.
pub fn load_guests(ctx: &DriverContext) -> std::result::Result<usize, StatusError> {
    let records = ctx.status().load_all()?;
    let count = records.len();
    for record in records {
        debug!("loaded status of guest '{}'", record.name);
        ctx.guests().insert(Arc::new(Guest::from_record(record)));
    }
    Ok(count)
}

/// Reconnects every active guest concurrently. A guest that cannot be
/// reconnected is stopped and dropped without affecting the others.
pub async fn reconnect_all(controller: &ProcessController) -> ReconnectReport {
    let mut tasks = JoinSet::new();
    for guest in controller.context().guests().list() {
        if !guest.is_active() {
            continue;
        }
        let controller = controller.clone();
        let _ = tasks.spawn(async move {
            let name = guest.name().clone();
            let outcome = reconnect(&controller, guest).await;
            (name, outcome)
        });
    }

    let mut report = ReconnectReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => report.outcomes.push(entry),
            Err(e) => error!("reconnect task failed: {e}"),
        }
    }
    report.outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    info!(
        "reconnected {} guest(s), stopped {}",
        report.reconnected(),
        report.stopped()
    );
    report
}

async fn reconnect(controller: &ProcessController, guest: Arc<Guest>) -> ReconnectOutcome {
    let ctx = controller.context();
    let name = guest.name().clone();

    let outcome = match ctx.jobs().acquire(&name, ctx.config().job_wait()).await {
        Err(e) => {
            warn!("cannot reconnect guest '{name}': {e}");
            controller.teardown(&guest, StateReason::Unknown).await;
            ReconnectOutcome::Stopped { reason: e.to_string() }
        }
        Ok(_job) => match resync(ctx, &guest).await {
            Ok(state) if state.is_finishing() => {
                info!("guest '{name}' was shutting down, finishing the stop");
                controller.teardown(&guest, StateReason::Daemon).await;
                ReconnectOutcome::Stopped { reason: format!("guest was {}", state.state) }
            }
            Ok(state) => {
                if let Err(e) = ctx.status().save(&guest.record()) {
                    warn!("{e}");
                }
                info!("reconnected guest '{name}' ({})", state.state);
                ReconnectOutcome::Reconnected(state)
            }
            Err(e) => {
                warn!("failed to reconnect guest '{name}': {e}");
                if guest.is_active() {
                    controller.teardown(&guest, StateReason::Unknown).await;
                }
                ReconnectOutcome::Stopped { reason: e.to_string() }
            }
        },
    };

    if !guest.is_active() {
        let _ = ctx.guests().remove(&name);
        ctx.jobs().forget(&name);
    }
    outcome
}

async fn resync(ctx: &DriverContext, guest: &Guest) -> Result<GuestState> {
    let name = guest.name();
    let def = guest.def();
    ctx.host_devices()
        .update_active(name, &def)
        .map_err(|source| ProcessError::HostDevices { name: name.clone(), source })?;

    let monitor = match guest.monitor() {
        Some(monitor) => monitor,
        None => {
            let monitor = Arc::new(MonitorHandle::open(ctx, guest).await?);
            guest.set_monitor(monitor.clone());
            monitor
        }
    };

    ctx.cgroups().connect_guest(name)?;

    let info = monitor.get_info().await?;
    guest.set_consoles(info.consoles());
    guest.state_cell().set_state(info.run_state());

    if let Err(e) = monitor.refresh_thread_info() {
        warn!("threads of guest '{name}' are unknown: {e}");
    }
    Ok(guest.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        guest::{GuestDef, RunState},
        host::{FileStatusStore, StatusStore},
        testing::RecordingCgroups,
    };
    use nix::unistd::Pid;
    use pretty_assertions::assert_eq;

    fn controller(dir: &std::path::Path) -> ProcessController {
        let config = DriverConfig {
            state_dir: dir.to_path_buf(),
            log_dir: dir.to_path_buf(),
            request_timeout_ms: 500,
            job_wait_ms: 100,
            stop_cgroup_backoff_ms: 1,
            ..Default::default()
        };
        ProcessController::new(
            DriverContext::builder(config)
                .cgroups(Arc::new(RecordingCgroups::default()))
                .build(),
        )
    }

    fn active_guest(name: &str) -> Guest {
        let guest = Guest::new(GuestName::new(name), GuestDef::default());
        guest.set_pid(Some(Pid::from_raw(i32::MAX)));
        guest.set_state(RunState::Running, StateReason::Booted);
        guest
    }

    #[tokio::test]
    async fn persisted_guests_are_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let store = FileStatusStore::new(dir.path());
        store.save(&active_guest("a").record()).expect("save");
        store.save(&active_guest("b").record()).expect("save");

        let found = load_guests(controller.context()).expect("load");

        assert_eq!(found, 2);
        let guest = controller
            .context()
            .guests()
            .get(&GuestName::new("a"))
            .expect("a is known");
        assert_eq!(guest.pid(), Some(Pid::from_raw(i32::MAX)));
    }

    #[tokio::test]
    async fn unreachable_guests_are_stopped_and_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let ctx = controller.context();
        ctx.guests().insert(Arc::new(active_guest("lost")));
        ctx.guests().insert(Arc::new(Guest::new(GuestName::new("idle"), GuestDef::default())));

        let report = reconnect_all(&controller).await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.stopped(), 1);
        assert!(ctx.guests().get(&GuestName::new("lost")).is_none());
        // guests that were never active are not touched
        assert!(ctx.guests().get(&GuestName::new("idle")).is_some());
    }

    #[tokio::test]
    async fn a_guest_whose_job_is_held_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let ctx = controller.context();
        let guest = Arc::new(active_guest("held"));
        ctx.guests().insert(guest.clone());
        let _held = ctx
            .jobs()
            .acquire(guest.name(), std::time::Duration::from_secs(1))
            .await
            .expect("job");

        let report = reconnect_all(&controller).await;

        assert!(matches!(
            report.outcomes.as_slice(),
            [(_, ReconnectOutcome::Stopped { .. })]
        ));
        assert_eq!(guest.state().state, RunState::ShutOff);
        assert!(ctx.guests().is_empty());
    }
}
