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

use super::{
    error::{PlacementError, Result},
    PlacementRequest, ThreadPlacer,
};
use crate::{
    cgroups::{CgroupBackend, Controller, ThreadGroup},
    guest::{CpuMask, CpuPlacement},
    host::{HostCpus, NumaTopology},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Places threads using the host's cgroups and scheduler syscalls.
#[derive(Debug, Clone)]
pub struct HostPlacer {
    cgroups: Arc<dyn CgroupBackend>,
    cpus: Arc<dyn HostCpus>,
    numa: Arc<dyn NumaTopology>,
}

/// The mask for the cpuset controller and the one for `sched_setaffinity`.
/// Only the latter falls back to every host cpu.
#[derive(Debug, PartialEq, Eq)]
struct Masks {
    cgroup: Option<CpuMask>,
    affinity: CpuMask,
}

impl HostPlacer {
    pub fn new(
        cgroups: Arc<dyn CgroupBackend>,
        cpus: Arc<dyn HostCpus>,
        numa: Arc<dyn NumaTopology>,
    ) -> Self {
        Self { cgroups, cpus, numa }
    }

    fn resolve_masks(&self, request: &PlacementRequest<'_>) -> Result<Masks> {
        let def = request.def;
        let node_mask = match (def.placement, &def.auto_cpuset) {
            (CpuPlacement::Auto, Some(auto)) => Some(auto.clone()),
            _ => match def.strict_nodeset() {
                Some(nodes) => Some(
                    self.numa
                        .nodeset_cpus(nodes)
                        .map_err(|source| PlacementError::HostCpus { source })?,
                ),
                None => None,
            },
        };

        let cgroup = request
            .cpumask
            .cloned()
            .or(node_mask)
            .or_else(|| def.cpumask.clone());

        let affinity = match &cgroup {
            Some(mask) => mask.clone(),
            None => self
                .cpus
                .online()
                .map_err(|source| PlacementError::HostCpus { source })?,
        };

        Ok(Masks { cgroup, affinity })
    }

    fn apply(
        &self,
        request: &PlacementRequest<'_>,
        masks: &Masks,
        created: &mut Option<ThreadGroup>,
    ) -> Result<()> {
        let guest = request.guest;
        let has_cpu = self.cgroups.has_controller(guest, Controller::Cpu);
        let has_cpuset = self.cgroups.has_controller(guest, Controller::CpuSet);

        if has_cpu || has_cpuset {
            self.cgroups.create_thread_group(guest, request.group)?;
            *created = Some(request.group);

            if has_cpuset {
                if let Some(mask) = &masks.cgroup {
                    self.cgroups.set_cpus(guest, request.group, mask)?;
                }
                if let Some(nodes) = request.def.strict_nodeset() {
                    self.cgroups.set_mems(guest, request.group, nodes)?;
                }
            }

            if request.wants_bandwidth() {
                self.cgroups.set_bandwidth(
                    guest,
                    Some(request.group),
                    request.period,
                    request.quota,
                )?;
            }

            self.cgroups.add_thread(guest, request.group, request.tid)?;
        }

        // affinity is applied even with cgroups, the cpuset controller may
        // be missing
        self.cpus.set_affinity(request.tid, &masks.affinity).map_err(
            |source| PlacementError::Affinity {
                tid: request.tid.as_raw(),
                source,
            },
        )?;

        if request.group != ThreadGroup::Emulator {
            if let Some(sched) = request.sched {
                self.cpus.set_scheduler(request.tid, sched).map_err(
                    |source| PlacementError::Scheduler {
                        tid: request.tid.as_raw(),
                        source,
                    },
                )?;
            }
        }

        Ok(())
    }
}

impl ThreadPlacer for HostPlacer {
    fn place(&self, request: &PlacementRequest<'_>) -> Result<()> {
        if request.wants_bandwidth()
            && !self.cgroups.has_controller(request.guest, Controller::Cpu)
        {
            return Err(PlacementError::Unsupported {
                what: "cpu bandwidth without the cgroup cpu controller",
            });
        }

        let masks = self.resolve_masks(request)?;

        let mut created = None;
        let result = self.apply(request, &masks, &mut created);
        match &result {
            Ok(()) => debug!(
                "placed thread {} of guest '{}' in {} on cpus {}",
                request.tid, request.guest, request.group, masks.affinity
            ),
            Err(e) => {
                warn!(
                    "failed to place thread {} of guest '{}': {e}",
                    request.tid, request.guest
                );
                if let Some(group) = created {
                    let _best_effort =
                        self.cgroups.remove_thread_group(request.guest, group);
                }
            }
        }
        result
    }
}
