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

use super::cpumask::CpuMask;
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, path::PathBuf};

/// Everything needed to create, boot and place one guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestDef {
    pub memory_mib: u64,
    pub kernel: PathBuf,
    pub cmdline: Vec<String>,
    pub initramfs: Option<PathBuf>,
    pub disks: Vec<DiskDef>,
    pub vcpus: Vec<VcpuDef>,
    /// Guest wide pinning, the fallback for every vcpu without its own mask.
    pub cpumask: Option<CpuMask>,
    pub placement: CpuPlacement,
    /// Result of automatic placement, filled in before start when
    /// `placement` is [CpuPlacement::Auto].
    pub auto_cpuset: Option<CpuMask>,
    pub numa: Option<NumaTune>,
    /// Number of guest NUMA cells.
    pub numa_cells: usize,
    pub cputune: CpuTune,
    pub nets: Vec<NetDef>,
    /// PCI addresses of host devices passed through to the guest.
    pub host_devices: Vec<String>,
}

impl GuestDef {
    pub fn max_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    pub fn online_vcpus(&self) -> impl Iterator<Item = &VcpuDef> {
        self.vcpus.iter().filter(|v| v.online)
    }

    pub fn boot_vcpus(&self) -> usize {
        self.online_vcpus().count()
    }

    /// The nodeset when memory must be bound strictly to it.
    pub fn strict_nodeset(&self) -> Option<&CpuMask> {
        match &self.numa {
            Some(NumaTune { mode: NumaMode::Strict, nodeset: Some(nodes) }) => {
                Some(nodes)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDef {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuDef {
    pub id: u32,
    #[serde(default = "online_default")]
    pub online: bool,
    #[serde(default)]
    pub cpumask: Option<CpuMask>,
    #[serde(default)]
    pub sched: Option<SchedParam>,
}

fn online_default() -> bool {
    true
}

impl VcpuDef {
    pub fn new(id: u32) -> Self {
        Self { id, online: true, cpumask: None, sched: None }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuPlacement {
    #[default]
    Static,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaTune {
    pub mode: NumaMode,
    /// Host NUMA nodes, in the same list syntax as cpu masks.
    pub nodeset: Option<CpuMask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaMode {
    Strict,
    Preferred,
    Interleave,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuTune {
    /// Bandwidth applied to each vcpu thread.
    pub period: Option<u64>,
    pub quota: Option<i64>,
    /// Bandwidth applied to the guest as a whole.
    pub global_period: Option<u64>,
    pub global_quota: Option<i64>,
    pub emulator_period: Option<u64>,
    pub emulator_quota: Option<i64>,
    pub iothread_period: Option<u64>,
    pub iothread_quota: Option<i64>,
    pub emulatorpin: Option<CpuMask>,
    pub emulator_sched: Option<SchedParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedParam {
    pub policy: SchedPolicy,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    Batch,
    Idle,
    Fifo,
    #[serde(rename = "rr")]
    RoundRobin,
}

/// A guest interface backed by host tap devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetDef {
    pub ifname: String,
    pub mac: Option<String>,
    /// Queue pairs; zero is read as one.
    pub queues: u32,
    pub queue_size: Option<u32>,
    pub ip: Option<Ipv4Addr>,
    pub mask: Option<Ipv4Addr>,
}

impl NetDef {
    pub fn queue_pairs(&self) -> usize {
        self.queues.max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_queues_mean_one_pair() {
        let net = NetDef { ifname: "tap0".into(), ..Default::default() };
        assert_eq!(net.queue_pairs(), 1);

        let net = NetDef { queues: 4, ..net };
        assert_eq!(net.queue_pairs(), 4);
    }

    #[test]
    fn only_strict_numa_exposes_a_nodeset() {
        let nodes: CpuMask = "0".parse().expect("valid list");
        let mut def = GuestDef {
            numa: Some(NumaTune {
                mode: NumaMode::Preferred,
                nodeset: Some(nodes.clone()),
            }),
            ..Default::default()
        };
        assert!(def.strict_nodeset().is_none());

        def.numa = Some(NumaTune { mode: NumaMode::Strict, nodeset: Some(nodes) });
        assert!(def.strict_nodeset().is_some());
    }

    #[test]
    fn definitions_load_from_json() {
        let def: GuestDef = serde_json::from_str(
            r#"{
                "memory_mib": 512,
                "kernel": "/var/lib/chd/vmlinux",
                "vcpus": [{"id": 0}, {"id": 1, "online": false, "cpumask": "2-3"}],
                "cputune": {"period": 100000, "quota": 50000},
                "nets": [{"ifname": "tap0", "queues": 2}]
            }"#,
        )
        .expect("valid definition");

        assert_eq!(def.max_vcpus(), 2);
        assert_eq!(def.boot_vcpus(), 1);
        assert_eq!(def.cputune.quota, Some(50000));
        assert_eq!(def.nets[0].queue_pairs(), 2);
    }
}
