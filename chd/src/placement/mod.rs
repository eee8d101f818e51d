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

pub use error::{PlacementError, Result};
pub use placer::HostPlacer;

use crate::{
    cgroups::ThreadGroup,
    guest::{CpuMask, GuestDef, GuestName, SchedParam},
};
use nix::unistd::Pid;
use std::fmt::Debug;

pub mod error;

mod placer;

/// Where and how one VMM thread should run.
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    pub guest: &'a GuestName,
    /// Supplies the fallback masks and the NUMA memory policy.
    pub def: &'a GuestDef,
    pub tid: Pid,
    pub group: ThreadGroup,
    pub cpumask: Option<&'a CpuMask>,
    pub period: Option<u64>,
    pub quota: Option<i64>,
    pub sched: Option<&'a SchedParam>,
}

impl<'a> PlacementRequest<'a> {
    pub fn new(
        guest: &'a GuestName,
        def: &'a GuestDef,
        tid: Pid,
        group: ThreadGroup,
    ) -> Self {
        Self {
            guest,
            def,
            tid,
            group,
            cpumask: None,
            period: None,
            quota: None,
            sched: None,
        }
    }

    pub fn cpumask(mut self, cpumask: Option<&'a CpuMask>) -> Self {
        self.cpumask = cpumask;
        self
    }

    pub fn bandwidth(mut self, period: Option<u64>, quota: Option<i64>) -> Self {
        self.period = period.filter(|p| *p != 0);
        self.quota = quota.filter(|q| *q != 0);
        self
    }

    pub fn sched(mut self, sched: Option<&'a SchedParam>) -> Self {
        self.sched = sched;
        self
    }

    pub fn wants_bandwidth(&self) -> bool {
        self.period.is_some() || self.quota.is_some()
    }
}

/// Applies cgroup membership, cpu affinity and scheduling to one thread.
pub trait ThreadPlacer: Debug + Send + Sync {
    fn place(&self, request: &PlacementRequest<'_>) -> Result<()>;
}
