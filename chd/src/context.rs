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

//! The driver context handed to every operation.

use crate::{
    cgroups::{CgroupBackend, HostCgroups},
    config::DriverConfig,
    guest::GuestList,
    host::{
        FileStatusStore, HostCpus, HostDevices, NixHostCpus, NumaTopology,
        StatusStore, SysfsNuma, VfioHostDevices,
    },
    jobs::JobRegistry,
    monitor::{CloudHypervisorLauncher, ProcfsThreads, ThreadLister, VmmLauncher},
    net::{LinkManager, NetlinkLinks, NetworkAttacher, TapProvider, TunTapProvider},
    placement::{HostPlacer, ThreadPlacer},
};
use std::sync::Arc;

/// Everything a driver instance owns: its configuration, the guests it
/// manages, their job tokens and the host facilities it acts through.
#[derive(Debug)]
pub struct DriverContext {
    config: DriverConfig,
    guests: GuestList,
    jobs: JobRegistry,
    cgroups: Arc<dyn CgroupBackend>,
    cpus: Arc<dyn HostCpus>,
    numa: Arc<dyn NumaTopology>,
    devices: Arc<dyn HostDevices>,
    status: Arc<dyn StatusStore>,
    threads: Arc<dyn ThreadLister>,
    launcher: Arc<dyn VmmLauncher>,
    network: NetworkAttacher,
    placer: Arc<dyn ThreadPlacer>,
}

impl DriverContext {
    pub fn builder(config: DriverConfig) -> DriverContextBuilder {
        DriverContextBuilder::new(config)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn guests(&self) -> &GuestList {
        &self.guests
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn cgroups(&self) -> &dyn CgroupBackend {
        self.cgroups.as_ref()
    }

    pub fn cpus(&self) -> &dyn HostCpus {
        self.cpus.as_ref()
    }

    pub fn numa(&self) -> &dyn NumaTopology {
        self.numa.as_ref()
    }

    pub fn host_devices(&self) -> &dyn HostDevices {
        self.devices.as_ref()
    }

    pub fn status(&self) -> &dyn StatusStore {
        self.status.as_ref()
    }

    pub fn thread_lister(&self) -> Arc<dyn ThreadLister> {
        self.threads.clone()
    }

    pub fn launcher(&self) -> &dyn VmmLauncher {
        self.launcher.as_ref()
    }

    pub fn network(&self) -> &NetworkAttacher {
        &self.network
    }

    pub fn placer(&self) -> &dyn ThreadPlacer {
        self.placer.as_ref()
    }
}

/// Builds a [DriverContext]. Anything not set uses the real host
/// implementation.
#[derive(Debug)]
pub struct DriverContextBuilder {
    config: DriverConfig,
    cgroups: Option<Arc<dyn CgroupBackend>>,
    cpus: Option<Arc<dyn HostCpus>>,
    numa: Option<Arc<dyn NumaTopology>>,
    devices: Option<Arc<dyn HostDevices>>,
    status: Option<Arc<dyn StatusStore>>,
    threads: Option<Arc<dyn ThreadLister>>,
    launcher: Option<Arc<dyn VmmLauncher>>,
    taps: Option<Arc<dyn TapProvider>>,
    links: Option<Arc<dyn LinkManager>>,
    placer: Option<Arc<dyn ThreadPlacer>>,
}

impl DriverContextBuilder {
    fn new(config: DriverConfig) -> Self {
        Self {
            config,
            cgroups: None,
            cpus: None,
            numa: None,
            devices: None,
            status: None,
            threads: None,
            launcher: None,
            taps: None,
            links: None,
            placer: None,
        }
    }

    pub fn cgroups(mut self, cgroups: Arc<dyn CgroupBackend>) -> Self {
        self.cgroups = Some(cgroups);
        self
    }

    pub fn cpus(mut self, cpus: Arc<dyn HostCpus>) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn numa(mut self, numa: Arc<dyn NumaTopology>) -> Self {
        self.numa = Some(numa);
        self
    }

    pub fn host_devices(mut self, devices: Arc<dyn HostDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn status(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn thread_lister(mut self, threads: Arc<dyn ThreadLister>) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn VmmLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn taps(mut self, taps: Arc<dyn TapProvider>) -> Self {
        self.taps = Some(taps);
        self
    }

    pub fn links(mut self, links: Arc<dyn LinkManager>) -> Self {
        self.links = Some(links);
        self
    }

    /// Replaces placement as a whole. Without it placement goes through
    /// the context's cgroups, cpus and NUMA topology.
    pub fn placer(mut self, placer: Arc<dyn ThreadPlacer>) -> Self {
        self.placer = Some(placer);
        self
    }

    pub fn build(self) -> Arc<DriverContext> {
        let config = self.config;
        let cgroups = self
            .cgroups
            .unwrap_or_else(|| Arc::new(HostCgroups::new(config.cgroup_parent.clone())));
        let cpus = self.cpus.unwrap_or_else(|| Arc::new(NixHostCpus::new()));
        let numa = self.numa.unwrap_or_else(|| Arc::new(SysfsNuma::default()));
        let placer = self.placer.unwrap_or_else(|| {
            Arc::new(HostPlacer::new(cgroups.clone(), cpus.clone(), numa.clone()))
        });
        let network = NetworkAttacher::new(
            self.taps.unwrap_or_else(|| Arc::new(TunTapProvider::default())),
            self.links.unwrap_or_else(|| Arc::new(NetlinkLinks)),
            config.request_timeout(),
        );

        Arc::new(DriverContext {
            guests: GuestList::new(),
            jobs: JobRegistry::new(),
            devices: self
                .devices
                .unwrap_or_else(|| Arc::new(VfioHostDevices::default())),
            status: self.status.unwrap_or_else(|| {
                Arc::new(FileStatusStore::new(config.state_dir.clone()))
            }),
            threads: self.threads.unwrap_or_else(|| Arc::new(ProcfsThreads)),
            launcher: self.launcher.unwrap_or_else(|| {
                Arc::new(CloudHypervisorLauncher::new(
                    config.vmm_binary.clone(),
                    config.socket_wait_timeout(),
                ))
            }),
            cgroups,
            cpus,
            numa,
            network,
            placer,
            config,
        })
    }
}
