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

//! Recording stand-ins for host facilities, shared by unit tests.

use crate::{
    cgroups::{CgroupBackend, CgroupsError, Controller, Result, ThreadGroup},
    guest::{CpuMask, GuestName, SchedParam},
    host::{HostCpus, NumaTopology},
    net::{LinkManager, TapProvider},
    placement::{self, PlacementRequest, ThreadPlacer},
};
use anyhow::anyhow;
use async_trait::async_trait;
use nix::unistd::Pid;
use std::{
    collections::HashSet,
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

#[derive(Debug, Default)]
pub(crate) struct RecordingCgroups {
    controllers: HashSet<Controller>,
    fail_add_thread: bool,
    busy_removals: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl RecordingCgroups {
    pub(crate) fn with(controllers: &[Controller]) -> Self {
        Self {
            controllers: controllers.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub(crate) fn failing_add_thread(mut self) -> Self {
        self.fail_add_thread = true;
        self
    }

    /// The next `n` guest removals report the cgroup as busy.
    pub(crate) fn busy_for(self, n: usize) -> Self {
        self.busy_removals.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }
}

impl CgroupBackend for RecordingCgroups {
    fn setup_guest(
        &self,
        guest: &GuestName,
        pid: Pid,
        nic_indexes: &[u32],
    ) -> Result<()> {
        self.record(format!("setup {guest} {pid} {nic_indexes:?}"));
        Ok(())
    }

    fn connect_guest(&self, guest: &GuestName) -> Result<()> {
        self.record(format!("connect {guest}"));
        Ok(())
    }

    fn has_controller(&self, _guest: &GuestName, controller: Controller) -> bool {
        self.controllers.contains(&controller)
    }

    fn set_bandwidth(
        &self,
        guest: &GuestName,
        group: Option<ThreadGroup>,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> Result<()> {
        match group {
            Some(group) => self.record(format!(
                "bandwidth {guest}/{group} {period:?} {quota:?}"
            )),
            None => {
                self.record(format!("bandwidth {guest} {period:?} {quota:?}"))
            }
        }
        Ok(())
    }

    fn create_thread_group(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
    ) -> Result<()> {
        self.record(format!("create {guest}/{group}"));
        Ok(())
    }

    fn set_cpus(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        cpus: &CpuMask,
    ) -> Result<()> {
        self.record(format!("cpus {guest}/{group} {cpus}"));
        Ok(())
    }

    fn set_mems(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        nodes: &CpuMask,
    ) -> Result<()> {
        self.record(format!("mems {guest}/{group} {nodes}"));
        Ok(())
    }

    fn add_thread(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        tid: Pid,
    ) -> Result<()> {
        self.record(format!("add {guest}/{group} {tid}"));
        if self.fail_add_thread {
            return Err(CgroupsError::AddTaskToCgroup {
                path: format!("{guest}/{group}"),
                tid: tid.as_raw(),
                source: anyhow!("no such process"),
            });
        }
        Ok(())
    }

    fn remove_thread_group(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
    ) -> Result<()> {
        self.record(format!("remove {guest}/{group}"));
        Ok(())
    }

    fn remove_guest(&self, guest: &GuestName) -> Result<()> {
        self.record(format!("remove-guest {guest}"));
        let busy = self
            .busy_removals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(CgroupsError::Busy { path: guest.to_string() });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct RecordingCpus {
    online: CpuMask,
    calls: Mutex<Vec<String>>,
}

impl RecordingCpus {
    pub(crate) fn new(online: &str) -> Self {
        Self {
            online: online.parse().expect("valid online list"),
            calls: Mutex::new(vec![]),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

impl HostCpus for RecordingCpus {
    fn online(&self) -> anyhow::Result<CpuMask> {
        Ok(self.online.clone())
    }

    fn set_affinity(&self, tid: Pid, mask: &CpuMask) -> anyhow::Result<()> {
        self.calls.lock().expect("calls").push(format!("affinity {tid} {mask}"));
        Ok(())
    }

    fn set_scheduler(&self, tid: Pid, sched: &SchedParam) -> anyhow::Result<()> {
        self.calls.lock().expect("calls").push(format!(
            "sched {tid} {:?} {}",
            sched.policy, sched.priority
        ));
        Ok(())
    }
}

/// Node N owns cpus `4N..4N+3`.
#[derive(Debug, Default)]
pub(crate) struct StaticNuma;

impl NumaTopology for StaticNuma {
    fn nodeset_cpus(&self, nodes: &CpuMask) -> anyhow::Result<CpuMask> {
        Ok(nodes.iter().flat_map(|n| n * 4..n * 4 + 4).collect())
    }
}

/// Remembers placement order instead of touching the host.
#[derive(Debug, Default)]
pub(crate) struct RecordingPlacer {
    placed: Mutex<Vec<(ThreadGroup, i32)>>,
}

impl RecordingPlacer {
    pub(crate) fn placed(&self) -> Vec<(ThreadGroup, i32)> {
        self.placed.lock().expect("placed").clone()
    }
}

impl ThreadPlacer for RecordingPlacer {
    fn place(&self, request: &PlacementRequest<'_>) -> placement::Result<()> {
        self.placed
            .lock()
            .expect("placed")
            .push((request.group, request.tid.as_raw()));
        Ok(())
    }
}

/// Hands out scratch files in place of tap queues.
#[derive(Debug, Default)]
pub(crate) struct StubTaps;

impl TapProvider for StubTaps {
    fn open_queues(
        &self,
        _ifname: &str,
        queues: usize,
    ) -> anyhow::Result<Vec<OwnedFd>> {
        (0..queues).map(|_| Ok(tempfile::tempfile()?.into())).collect()
    }
}

/// Links numbered in the order they are first looked up.
#[derive(Debug, Default)]
pub(crate) struct RecordingLinks {
    names: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingLinks {
    pub(crate) fn index_of(&self, ifname: &str) -> u32 {
        let mut names = self.names.lock().expect("names");
        let position = match names.iter().position(|n| n == ifname) {
            Some(position) => position,
            None => {
                names.push(ifname.to_string());
                names.len() - 1
            }
        };
        position as u32 + 100
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl LinkManager for RecordingLinks {
    async fn index(&self, ifname: &str) -> anyhow::Result<u32> {
        Ok(self.index_of(ifname))
    }

    async fn set_up(&self, ifname: &str) -> anyhow::Result<()> {
        self.calls.lock().expect("calls").push(format!("up {ifname}"));
        Ok(())
    }
}
