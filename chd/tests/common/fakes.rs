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

use super::fake_vmm::FakeVmm;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chd::{
    cgroups::{self, CgroupBackend, Controller, ThreadGroup},
    guest::{CpuMask, GuestName, SchedParam},
    host::HostCpus,
    monitor::{LaunchSpec, ThreadLister, VmmLauncher},
    net::{LinkManager, TapProvider},
    placement::{self, PlacementRequest, ThreadPlacer},
    version::{self, VersionError},
};
use nix::{sys::signal::kill, unistd::Pid};
use std::{
    collections::HashMap,
    os::fd::OwnedFd,
    sync::Mutex,
};
use tokio::process::Command;

/// Launches a `sleep` process as the VMM and serves a [FakeVmm] on the api
/// socket.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    vmms: Mutex<HashMap<GuestName, FakeVmm>>,
    failing: bool,
    rejected: Vec<(String, u16)>,
}

impl FakeLauncher {
    pub fn failing() -> Self {
        Self { failing: true, ..Default::default() }
    }

    /// Every VMM launched answers `endpoint` with `code`.
    pub fn rejecting(endpoint: &str, code: u16) -> Self {
        Self { rejected: vec![(endpoint.to_string(), code)], ..Default::default() }
    }

    /// The VMM most recently launched for `guest`.
    pub fn vmm(&self, guest: &GuestName) -> FakeVmm {
        self.vmms
            .lock()
            .expect("vmms")
            .get(guest)
            .cloned()
            .expect("guest was launched")
    }

    pub fn launches(&self) -> usize {
        self.vmms.lock().expect("vmms").len()
    }
}

#[async_trait]
impl VmmLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Pid> {
        if self.failing {
            bail!("VMM exited with exit status: 1 before its api socket appeared");
        }

        let vmm = FakeVmm::default();
        for (endpoint, code) in &self.rejected {
            vmm.fail(endpoint, *code);
        }
        let _ = std::fs::remove_file(&spec.socket);
        vmm.serve(&spec.socket)?;
        let pid = spawn_sleeper()?;
        let _ = self.vmms.lock().expect("vmms").insert(spec.guest.clone(), vmm);
        Ok(pid)
    }

    async fn version(&self) -> Result<u64, VersionError> {
        version::parse("cloud-hypervisor v38.0.0")
    }
}

/// A real, reaped child that can be signalled like a VMM.
pub fn spawn_sleeper() -> anyhow::Result<Pid> {
    let mut child = Command::new("sleep").arg("60").kill_on_drop(false).spawn()?;
    let pid = child
        .id()
        .map(|id| Pid::from_raw(id as i32))
        .ok_or_else(|| anyhow!("sleep exited right away"))?;
    let _ = tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(pid)
}

/// Reports a fixed thread layout for every live process: the main thread,
/// one disk worker and two vcpus.
#[derive(Debug, Default)]
pub struct FakeThreads;

impl ThreadLister for FakeThreads {
    fn threads(&self, pid: Pid) -> anyhow::Result<Vec<(Pid, String)>> {
        kill(pid, None)?;
        let tid = |offset: i32| Pid::from_raw(pid.as_raw() + offset);
        Ok(vec![
            (pid, "cloud-hypervisor".to_string()),
            (tid(1), "_disk0_q0".to_string()),
            (tid(2), "vcpu0".to_string()),
            (tid(3), "vcpu1".to_string()),
        ])
    }

    fn affinity(&self, _tid: Pid) -> Option<CpuMask> {
        "0-3".parse().ok()
    }
}

/// A VMM that has not started any threads yet.
#[derive(Debug)]
pub struct NoThreadsYet;

impl ThreadLister for NoThreadsYet {
    fn threads(&self, pid: Pid) -> anyhow::Result<Vec<(Pid, String)>> {
        kill(pid, None)?;
        Ok(vec![])
    }

    fn affinity(&self, _tid: Pid) -> Option<CpuMask> {
        None
    }
}

#[derive(Debug, Default)]
pub struct RecordingCgroups {
    calls: Mutex<Vec<String>>,
}

impl RecordingCgroups {
    pub fn calls(&self) -> Vec<String> {
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
        _pid: Pid,
        nic_indexes: &[u32],
    ) -> cgroups::Result<()> {
        self.record(format!("setup {guest} {nic_indexes:?}"));
        Ok(())
    }

    fn connect_guest(&self, guest: &GuestName) -> cgroups::Result<()> {
        self.record(format!("connect {guest}"));
        Ok(())
    }

    fn has_controller(&self, _guest: &GuestName, _controller: Controller) -> bool {
        true
    }

    fn set_bandwidth(
        &self,
        guest: &GuestName,
        _group: Option<ThreadGroup>,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> cgroups::Result<()> {
        self.record(format!("bandwidth {guest} {period:?} {quota:?}"));
        Ok(())
    }

    fn create_thread_group(
        &self,
        _guest: &GuestName,
        _group: ThreadGroup,
    ) -> cgroups::Result<()> {
        Ok(())
    }

    fn set_cpus(
        &self,
        _guest: &GuestName,
        _group: ThreadGroup,
        _cpus: &CpuMask,
    ) -> cgroups::Result<()> {
        Ok(())
    }

    fn set_mems(
        &self,
        _guest: &GuestName,
        _group: ThreadGroup,
        _nodes: &CpuMask,
    ) -> cgroups::Result<()> {
        Ok(())
    }

    fn add_thread(
        &self,
        _guest: &GuestName,
        _group: ThreadGroup,
        _tid: Pid,
    ) -> cgroups::Result<()> {
        Ok(())
    }

    fn remove_thread_group(
        &self,
        _guest: &GuestName,
        _group: ThreadGroup,
    ) -> cgroups::Result<()> {
        Ok(())
    }

    fn remove_guest(&self, guest: &GuestName) -> cgroups::Result<()> {
        self.record(format!("remove {guest}"));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingCpus {
    calls: Mutex<Vec<String>>,
}

impl RecordingCpus {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

impl HostCpus for RecordingCpus {
    fn online(&self) -> anyhow::Result<CpuMask> {
        Ok("0-7".parse()?)
    }

    fn set_affinity(&self, tid: Pid, mask: &CpuMask) -> anyhow::Result<()> {
        self.calls.lock().expect("calls").push(format!("affinity {tid} {mask}"));
        Ok(())
    }

    fn set_scheduler(&self, _tid: Pid, _sched: &SchedParam) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingPlacer {
    placed: Mutex<Vec<ThreadGroup>>,
}

impl RecordingPlacer {
    pub fn placed(&self) -> Vec<ThreadGroup> {
        self.placed.lock().expect("placed").clone()
    }
}

impl ThreadPlacer for RecordingPlacer {
    fn place(&self, request: &PlacementRequest<'_>) -> placement::Result<()> {
        self.placed.lock().expect("placed").push(request.group);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StubTaps;

impl TapProvider for StubTaps {
    fn open_queues(&self, _ifname: &str, queues: usize) -> anyhow::Result<Vec<OwnedFd>> {
        (0..queues).map(|_| Ok(tempfile::tempfile()?.into())).collect()
    }
}

/// Taps that can never be opened, as without `/dev/net/tun`.
#[derive(Debug, Default)]
pub struct FailingTaps;

impl TapProvider for FailingTaps {
    fn open_queues(&self, ifname: &str, _queues: usize) -> anyhow::Result<Vec<OwnedFd>> {
        bail!("failed to open tap '{ifname}': no such device")
    }
}

#[derive(Debug, Default)]
pub struct RecordingLinks {
    calls: Mutex<Vec<String>>,
}

impl RecordingLinks {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl LinkManager for RecordingLinks {
    async fn index(&self, ifname: &str) -> anyhow::Result<u32> {
        let digits: String = ifname.chars().filter(char::is_ascii_digit).collect();
        Ok(100 + digits.parse::<u32>().unwrap_or(0))
    }

    async fn set_up(&self, ifname: &str) -> anyhow::Result<()> {
        self.calls.lock().expect("calls").push(format!("up {ifname}"));
        Ok(())
    }
}
