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

//! Host facilities the driver depends on, each behind a trait so that tests
//! can substitute them.

pub use devices::{HostDevices, VfioHostDevices};
pub use numa::{NumaTopology, SysfsNuma};
pub use status::{FileStatusStore, StatusError, StatusStore};

use crate::guest::{CpuMask, SchedParam, SchedPolicy};
use anyhow::{anyhow, Context};
use nix::{sched::sched_setaffinity, unistd::Pid};
use std::{fmt::Debug, path::PathBuf};

mod devices;
mod numa;
mod status;

/// CPU facilities of the host.
pub trait HostCpus: Debug + Send + Sync {
    /// Every online host cpu.
    fn online(&self) -> anyhow::Result<CpuMask>;

    fn set_affinity(&self, tid: Pid, mask: &CpuMask) -> anyhow::Result<()>;

    fn set_scheduler(&self, tid: Pid, sched: &SchedParam) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct NixHostCpus {
    sysfs_cpu: PathBuf,
}

impl Default for NixHostCpus {
    fn default() -> Self {
        Self { sysfs_cpu: PathBuf::from("/sys/devices/system/cpu") }
    }
}

impl NixHostCpus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostCpus for NixHostCpus {
    fn online(&self) -> anyhow::Result<CpuMask> {
        let path = self.sysfs_cpu.join("online");
        let list = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(list.parse()?)
    }

    fn set_affinity(&self, tid: Pid, mask: &CpuMask) -> anyhow::Result<()> {
        if mask.is_empty() {
            return Err(anyhow!("refusing to set an empty affinity on {tid}"));
        }
        let set = mask.to_cpu_set()?;
        sched_setaffinity(tid, &set)
            .with_context(|| format!("sched_setaffinity({tid}, {mask})"))
    }

    fn set_scheduler(&self, tid: Pid, sched: &SchedParam) -> anyhow::Result<()> {
        let (policy, priority) = match sched.policy {
            SchedPolicy::Batch => (libc::SCHED_BATCH, 0),
            SchedPolicy::Idle => (libc::SCHED_IDLE, 0),
            SchedPolicy::Fifo => (libc::SCHED_FIFO, sched.priority),
            SchedPolicy::RoundRobin => (libc::SCHED_RR, sched.priority),
        };
        let param = libc::sched_param { sched_priority: priority };

        // SAFETY: `param` outlives the call and the kernel only reads it.
        let rc = unsafe {
            libc::sched_setscheduler(tid.as_raw(), policy, &param)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| {
                format!("sched_setscheduler({tid}, {:?})", sched.policy)
            });
        }
        Ok(())
    }
}
