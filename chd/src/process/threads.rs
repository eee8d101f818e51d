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

use crate::{
    cgroups::ThreadGroup,
    guest::{CpuPlacement, GuestDef, GuestName},
    monitor::{ThreadKind, ThreadRecord},
    placement::{self, PlacementError, PlacementRequest, ThreadPlacer},
};
use nix::unistd::Pid;
use std::collections::HashMap;
use tracing::debug;

/// Places every thread of the snapshot. Emulator threads go first, then
/// I/O threads, then vcpus.
pub(super) fn place_threads(
    placer: &dyn ThreadPlacer,
    name: &GuestName,
    def: &GuestDef,
    threads: &[ThreadRecord],
) -> placement::Result<()> {
    place_emulator_threads(placer, name, def, threads)?;
    place_io_threads(placer, name, def, threads)?;
    place_vcpus(placer, name, def, threads)
}

fn place_emulator_threads(
    placer: &dyn ThreadPlacer,
    name: &GuestName,
    def: &GuestDef,
    threads: &[ThreadRecord],
) -> placement::Result<()> {
    let tune = &def.cputune;
    for record in threads {
        let ThreadKind::Emulator { name: thread } = &record.kind else {
            continue;
        };
        debug!(guest = %name, tid = %record.tid, "placing emulator thread {thread}");
        placer.place(
            &PlacementRequest::new(name, def, record.tid, ThreadGroup::Emulator)
                .cpumask(tune.emulatorpin.as_ref())
                .bandwidth(tune.emulator_period, tune.emulator_quota)
                .sched(tune.emulator_sched.as_ref()),
        )?;
    }
    Ok(())
}

fn place_io_threads(
    placer: &dyn ThreadPlacer,
    name: &GuestName,
    def: &GuestDef,
    threads: &[ThreadRecord],
) -> placement::Result<()> {
    // the VMM takes no per thread settings for its device workers
    let cpumask = match def.placement {
        CpuPlacement::Auto => def.auto_cpuset.as_ref(),
        CpuPlacement::Static => None,
    };
    let tune = &def.cputune;

    let io_threads = threads
        .iter()
        .filter(|record| matches!(record.kind, ThreadKind::IoThread { .. }));
    for (index, record) in io_threads.enumerate() {
        debug!(guest = %name, tid = %record.tid, "placing I/O thread {index}");
        placer.place(
            &PlacementRequest::new(
                name,
                def,
                record.tid,
                ThreadGroup::IoThread(index as u32),
            )
            .cpumask(cpumask)
            .bandwidth(tune.iothread_period, tune.iothread_quota),
        )?;
    }
    Ok(())
}

fn place_vcpus(
    placer: &dyn ThreadPlacer,
    name: &GuestName,
    def: &GuestDef,
    threads: &[ThreadRecord],
) -> placement::Result<()> {
    let tids: HashMap<u32, Pid> = threads
        .iter()
        .filter_map(|record| match record.kind {
            ThreadKind::Vcpu { index } => Some((index, record.tid)),
            _ => None,
        })
        .collect();

    if tids.is_empty() {
        // without vcpu threads only the guest wide mask can be honoured
        for vcpu in def.online_vcpus() {
            if let Some(mask) = &vcpu.cpumask {
                if def.cpumask.as_ref() != Some(mask) {
                    return Err(PlacementError::UnsupportedOperation {
                        reason: format!(
                            "vcpu {} has its own cpu affinity but the VMM \
                             exposes no vcpu threads",
                            vcpu.id
                        ),
                    });
                }
            }
        }
        return Ok(());
    }

    let tune = &def.cputune;
    for vcpu in def.online_vcpus() {
        let Some(tid) = tids.get(&vcpu.id) else {
            debug!(guest = %name, "vcpu {} has no thread yet", vcpu.id);
            continue;
        };
        placer.place(
            &PlacementRequest::new(name, def, *tid, ThreadGroup::Vcpu(vcpu.id))
                .cpumask(vcpu.cpumask.as_ref())
                .bandwidth(tune.period, tune.quota)
                .sched(vcpu.sched.as_ref()),
        )?;
    }
    Ok(())
}
