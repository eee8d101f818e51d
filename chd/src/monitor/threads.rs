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

use crate::guest::CpuMask;
use nix::unistd::Pid;
use std::fmt::Debug;
use tracing::{debug, warn};

/// What a VMM thread does, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadKind {
    /// Runs guest vcpu `index`.
    Vcpu { index: u32 },
    /// Device worker such as `_disk0_q0` or `_net1`.
    IoThread { name: String },
    Emulator { name: String },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub tid: Pid,
    pub kind: ThreadKind,
}

/// An I/O thread as reported to callers, with its current affinity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoThreadInfo {
    pub tid: Pid,
    pub name: String,
    pub cpumask: Option<CpuMask>,
}

// cloud-hypervisor names every device worker `_<device>...`
const IO_THREAD_PREFIX: char = '_';

pub fn classify(name: &str) -> ThreadKind {
    let name = name.trim_end();
    if let Some(index) = name.strip_prefix("vcpu") {
        return match index.parse() {
            Ok(index) => ThreadKind::Vcpu { index },
            Err(_) => {
                warn!("vcpu thread '{name}' has no usable index");
                ThreadKind::Unknown
            }
        };
    }
    if name.starts_with(IO_THREAD_PREFIX) {
        return ThreadKind::IoThread { name: name.to_string() };
    }
    ThreadKind::Emulator { name: name.to_string() }
}

/// Lists the threads of a process as `(tid, name)`.
pub trait ThreadLister: Debug + Send + Sync {
    fn threads(&self, pid: Pid) -> anyhow::Result<Vec<(Pid, String)>>;

    /// Current affinity of one thread, `None` when it cannot be read.
    fn affinity(&self, tid: Pid) -> Option<CpuMask>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsThreads;

impl ThreadLister for ProcfsThreads {
    fn threads(&self, pid: Pid) -> anyhow::Result<Vec<(Pid, String)>> {
        let process = procfs::process::Process::new(pid.as_raw())?;
        let mut threads = vec![];
        for task in process.tasks()? {
            // threads may exit while we walk the list
            let Ok(task) = task else { continue };
            match task.stat() {
                Ok(stat) => threads.push((Pid::from_raw(task.tid), stat.comm)),
                Err(e) => debug!("skipping thread {}: {e}", task.tid),
            }
        }
        Ok(threads)
    }

    fn affinity(&self, tid: Pid) -> Option<CpuMask> {
        let set = nix::sched::sched_getaffinity(tid).ok()?;
        Some(
            (0..nix::sched::CpuSet::count())
                .filter(|cpu| set.is_set(*cpu).unwrap_or(false))
                .collect(),
        )
    }
}
