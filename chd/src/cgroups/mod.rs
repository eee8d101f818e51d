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

pub use cgroup::HostCgroups;
pub use error::{CgroupsError, Result};

use crate::guest::{CpuMask, GuestName};
use nix::unistd::Pid;
use std::fmt::{self, Debug, Display};

pub mod error;

mod cgroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    Cpu,
    CpuSet,
}

/// Per thread sub-cgroups below a guest's cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreadGroup {
    Emulator,
    Vcpu(u32),
    IoThread(u32),
}

impl Display for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ThreadGroup::Emulator => write!(f, "emulator"),
            ThreadGroup::Vcpu(id) => write!(f, "vcpu{id}"),
            ThreadGroup::IoThread(id) => write!(f, "iothread{id}"),
        }
    }
}

/// Cgroup operations the driver performs.
///
/// Each guest gets one cgroup. Individual VMM threads are moved into
/// [ThreadGroup] children of it.
pub trait CgroupBackend: Debug + Send + Sync {
    /// Creates the guest cgroup and moves the whole VMM process into it.
    /// `nic_indexes` are the host interfaces backing the guest's network.
    fn setup_guest(
        &self,
        guest: &GuestName,
        pid: Pid,
        nic_indexes: &[u32],
    ) -> Result<()>;

    /// Adopts the existing cgroup of a guest found after a restart.
    fn connect_guest(&self, guest: &GuestName) -> Result<()>;

    /// Whether the controller is available to the guest cgroup. False when
    /// the guest has none.
    fn has_controller(&self, guest: &GuestName, controller: Controller) -> bool;

    /// Applies bandwidth to a thread group, or to the whole guest when
    /// `group` is `None`.
    fn set_bandwidth(
        &self,
        guest: &GuestName,
        group: Option<ThreadGroup>,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> Result<()>;

    fn create_thread_group(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
    ) -> Result<()>;

    fn set_cpus(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        cpus: &CpuMask,
    ) -> Result<()>;

    /// Binds memory allocation of the group to the given NUMA nodes.
    fn set_mems(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        nodes: &CpuMask,
    ) -> Result<()>;

    fn add_thread(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        tid: Pid,
    ) -> Result<()>;

    fn remove_thread_group(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
    ) -> Result<()>;

    /// Removes the guest cgroup with all of its children. Fails with
    /// [CgroupsError::Busy] while tasks are still exiting. A guest without
    /// a cgroup is not an error.
    fn remove_guest(&self, guest: &GuestName) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_groups_name_their_directories() {
        assert_eq!(ThreadGroup::Emulator.to_string(), "emulator");
        assert_eq!(ThreadGroup::Vcpu(3).to_string(), "vcpu3");
        assert_eq!(ThreadGroup::IoThread(12).to_string(), "iothread12");
    }
}
