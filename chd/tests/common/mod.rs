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

#![allow(dead_code)]

pub mod fake_vmm;
pub mod fakes;

use chd::{
    config::DriverConfig,
    context::DriverContext,
    guest::{Guest, GuestDef, GuestName, NetDef, VcpuDef},
    host::VfioHostDevices,
    monitor::ThreadLister,
    net::TapProvider,
    process::ProcessController,
};
use fakes::{
    FakeLauncher, FakeThreads, RecordingCgroups, RecordingCpus, RecordingLinks,
    RecordingPlacer, StubTaps,
};
use std::sync::Arc;
use tempfile::TempDir;

/// A driver wired to fakes for everything that would touch the host. The
/// VMMs it launches are `sleep` processes fronted by a [fake_vmm::FakeVmm].
pub struct Harness {
    pub dir: TempDir,
    pub launcher: Arc<FakeLauncher>,
    pub cgroups: Arc<RecordingCgroups>,
    pub cpus: Arc<RecordingCpus>,
    pub placer: Arc<RecordingPlacer>,
    pub links: Arc<RecordingLinks>,
    taps: Arc<dyn TapProvider>,
    threads: Arc<dyn ThreadLister>,
    pub controller: ProcessController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(FakeLauncher::default()), Arc::new(StubTaps))
    }

    pub fn with(launcher: Arc<FakeLauncher>, taps: Arc<dyn TapProvider>) -> Self {
        Self::build(launcher, taps, Arc::new(FakeThreads))
    }

    /// A driver whose VMMs list the given threads.
    pub fn with_threads(threads: Arc<dyn ThreadLister>) -> Self {
        Self::build(Arc::new(FakeLauncher::default()), Arc::new(StubTaps), threads)
    }

    fn build(
        launcher: Arc<FakeLauncher>,
        taps: Arc<dyn TapProvider>,
        threads: Arc<dyn ThreadLister>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let cgroups = Arc::new(RecordingCgroups::default());
        let cpus = Arc::new(RecordingCpus::default());
        let placer = Arc::new(RecordingPlacer::default());
        let links = Arc::new(RecordingLinks::default());
        let controller = ProcessController::new(build_context(
            &dir,
            &launcher,
            &cgroups,
            &cpus,
            &placer,
            &links,
            &taps,
            &threads,
        ));
        Self { dir, launcher, cgroups, cpus, placer, links, taps, threads, controller }
    }

    pub fn ctx(&self) -> &Arc<DriverContext> {
        self.controller.context()
    }

    /// A second driver instance on the same state directory, as after a
    /// restart. Running VMMs are left alone.
    pub fn restart(&self) -> ProcessController {
        ProcessController::new(build_context(
            &self.dir,
            &self.launcher,
            &self.cgroups,
            &self.cpus,
            &self.placer,
            &self.links,
            &self.taps,
            &self.threads,
        ))
    }

    /// Registers a new guest with a unique name.
    pub fn guest(&self, def: GuestDef) -> Arc<Guest> {
        let name = GuestName::new(test_helpers::unique_guest_name("vm"));
        let guest = Arc::new(Guest::new(name, def));
        self.ctx().guests().insert(guest.clone());
        guest
    }
}

fn build_context(
    dir: &TempDir,
    launcher: &Arc<FakeLauncher>,
    cgroups: &Arc<RecordingCgroups>,
    cpus: &Arc<RecordingCpus>,
    placer: &Arc<RecordingPlacer>,
    links: &Arc<RecordingLinks>,
    taps: &Arc<dyn TapProvider>,
    threads: &Arc<dyn ThreadLister>,
) -> Arc<DriverContext> {
    let config = DriverConfig {
        state_dir: dir.path().join("run"),
        log_dir: dir.path().join("log"),
        request_timeout_ms: 2_000,
        job_wait_ms: 500,
        stop_cgroup_backoff_ms: 1,
        ..Default::default()
    };
    std::fs::create_dir_all(&config.state_dir).expect("state dir");

    DriverContext::builder(config)
        .launcher(launcher.clone())
        .cgroups(cgroups.clone())
        .cpus(cpus.clone())
        .placer(placer.clone())
        .links(links.clone())
        .taps(taps.clone())
        .thread_lister(threads.clone())
        .host_devices(Arc::new(VfioHostDevices::new(dir.path().join("pci"))))
        .build()
}

/// Two vcpus and one single-queue interface.
pub fn small_guest() -> GuestDef {
    GuestDef {
        memory_mib: 512,
        kernel: "/var/lib/chd/vmlinux".into(),
        cmdline: vec!["console=hvc0".into()],
        vcpus: vec![VcpuDef::new(0), VcpuDef::new(1)],
        nets: vec![NetDef { ifname: "tap0".into(), ..Default::default() }],
        ..Default::default()
    }
}
