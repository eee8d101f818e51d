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
    error::{CgroupsError, Result},
    CgroupBackend, Controller, ThreadGroup,
};
use crate::guest::{CpuMask, GuestName};
use anyhow::anyhow;
use cgroups_rs::{
    cpu::CpuController, cpuset::CpuSetController, hierarchies, Cgroup,
    CgroupPid,
};
use nix::unistd::Pid;
use std::{
    collections::HashMap,
    error::Error as StdError,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct GuestCgroup {
    nic_indexes: Vec<u32>,
}

/// Cgroups on the running host, v1 or v2 as detected by `cgroups-rs`.
///
/// Guest cgroups live at `<parent>/chd-<guest>`, their thread groups one
/// level below. On v2 thread groups are switched to threaded mode so that
/// single threads can be moved between them.
#[derive(Debug)]
pub struct HostCgroups {
    parent: String,
    guests: Mutex<HashMap<GuestName, GuestCgroup>>,
}

impl HostCgroups {
    pub fn new(parent: impl Into<String>) -> Self {
        Self { parent: parent.into(), guests: Mutex::new(HashMap::new()) }
    }

    fn guest_path(&self, guest: &GuestName) -> String {
        format!("{}/chd-{guest}", self.parent)
    }

    fn known_path(&self, guest: &GuestName) -> Result<String> {
        if self.guests().contains_key(guest) {
            Ok(self.guest_path(guest))
        } else {
            Err(CgroupsError::NoGuestCgroup { guest: guest.clone() })
        }
    }

    fn thread_path(&self, guest: &GuestName, group: ThreadGroup) -> Result<String> {
        Ok(format!("{}/{group}", self.known_path(guest)?))
    }

    fn guests(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<GuestName, GuestCgroup>> {
        self.guests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The nic indexes recorded for a guest at setup.
    pub fn nic_indexes(&self, guest: &GuestName) -> Option<Vec<u32>> {
        self.guests().get(guest).map(|g| g.nic_indexes.clone())
    }

    fn create_threaded(path: &str) -> Result<Cgroup> {
        let hierarchy = hierarchies::auto();
        let cgroup_type = hierarchy.root().join(path).join("cgroup.type");
        let threaded = hierarchy.v2();

        let cgroup = Cgroup::new(hierarchy, path).map_err(|e| {
            CgroupsError::CreateCgroup { path: path.to_string(), source: e.into() }
        })?;

        if threaded {
            if let Err(e) = std::fs::write(&cgroup_type, "threaded") {
                let _ = cgroup.delete();
                return Err(CgroupsError::CreateCgroup {
                    path: path.to_string(),
                    source: e.into(),
                });
            }
        }

        Ok(cgroup)
    }

    /// Directories of the cgroup, one per mounted hierarchy.
    fn directories(path: &str) -> Vec<PathBuf> {
        let hierarchy = hierarchies::auto();
        let root = hierarchy.root();
        if hierarchy.v2() {
            return vec![root.join(path)];
        }
        ["cpu", "cpuset", "cpu,cpuacct"]
            .iter()
            .map(|controller| root.join(controller).join(path))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    fn children(path: &str) -> Vec<String> {
        let mut children: Vec<String> = Self::directories(path)
            .iter()
            .filter_map(|dir| std::fs::read_dir(dir).ok())
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        children.sort();
        children.dedup();
        children
    }

    fn delete(path: &str) -> Result<()> {
        let cgroup = Cgroup::load(hierarchies::auto(), path);
        cgroup.delete().map_err(|e| {
            if is_busy(&e) {
                CgroupsError::Busy { path: path.to_string() }
            } else {
                CgroupsError::DeleteCgroup {
                    path: path.to_string(),
                    source: e.into(),
                }
            }
        })
    }
}

fn is_busy(err: &cgroups_rs::error::Error) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.raw_os_error() == Some(libc::EBUSY) {
                return true;
            }
        }
        current = e.source();
    }
    err.to_string().contains("Device or resource busy")
}

fn apply_err<'a>(
    path: &'a str,
    setting: &'static str,
) -> impl FnOnce(cgroups_rs::error::Error) -> CgroupsError + 'a {
    move |e| CgroupsError::Apply {
        path: path.to_string(),
        setting,
        source: e.into(),
    }
}

fn missing_controller(path: &str, setting: &'static str) -> CgroupsError {
    CgroupsError::Apply {
        path: path.to_string(),
        setting,
        source: anyhow!("controller not available"),
    }
}

impl CgroupBackend for HostCgroups {
    fn setup_guest(
        &self,
        guest: &GuestName,
        pid: Pid,
        nic_indexes: &[u32],
    ) -> Result<()> {
        let path = self.guest_path(guest);
        let cgroup = Cgroup::new(hierarchies::auto(), &path).map_err(|e| {
            CgroupsError::CreateCgroup { path: path.clone(), source: e.into() }
        })?;

        // v2 only allows processes in leaves, the VMM starts out in the
        // emulator group
        let emulator_path = format!("{path}/{}", ThreadGroup::Emulator);
        let emulator = match Self::create_threaded(&emulator_path) {
            Ok(emulator) => emulator,
            Err(e) => {
                let _ = cgroup.delete();
                return Err(e);
            }
        };

        if let Err(e) =
            emulator.add_task_by_tgid(CgroupPid::from(pid.as_raw() as u64))
        {
            let _ = emulator.delete();
            let _ = cgroup.delete();
            return Err(CgroupsError::AddTaskToCgroup {
                path,
                tid: pid.as_raw(),
                source: e.into(),
            });
        }

        debug!(
            "guest '{guest}' placed in cgroup '{path}' with nics {nic_indexes:?}"
        );
        let _ = self.guests().insert(
            guest.clone(),
            GuestCgroup { nic_indexes: nic_indexes.to_vec() },
        );
        Ok(())
    }

    fn connect_guest(&self, guest: &GuestName) -> Result<()> {
        let path = self.guest_path(guest);
        if Self::directories(&path).iter().all(|dir| !dir.is_dir()) {
            return Err(CgroupsError::NoGuestCgroup { guest: guest.clone() });
        }
        let _ = self
            .guests()
            .entry(guest.clone())
            .or_insert(GuestCgroup { nic_indexes: vec![] });
        Ok(())
    }

    fn has_controller(&self, guest: &GuestName, controller: Controller) -> bool {
        let Ok(path) = self.known_path(guest) else {
            return false;
        };
        let cgroup = Cgroup::load(hierarchies::auto(), path);
        match controller {
            Controller::Cpu => cgroup.controller_of::<CpuController>().is_some(),
            Controller::CpuSet => {
                cgroup.controller_of::<CpuSetController>().is_some()
            }
        }
    }

    fn set_bandwidth(
        &self,
        guest: &GuestName,
        group: Option<ThreadGroup>,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> Result<()> {
        let path = match group {
            Some(group) => self.thread_path(guest, group)?,
            None => self.known_path(guest)?,
        };
        let cgroup = Cgroup::load(hierarchies::auto(), path.as_str());
        let cpu = cgroup
            .controller_of::<CpuController>()
            .ok_or_else(|| missing_controller(&path, "cpu bandwidth"))?;

        cpu.set_cfs_quota_and_period(quota, period)
            .map_err(apply_err(&path, "cpu bandwidth"))?;
        trace!("cgroup '{path}': period={period:?} quota={quota:?}");
        Ok(())
    }

    fn create_thread_group(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
    ) -> Result<()> {
        let path = self.thread_path(guest, group)?;
        let _ = Self::create_threaded(&path)?;
        Ok(())
    }

    fn set_cpus(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        cpus: &CpuMask,
    ) -> Result<()> {
        let path = self.thread_path(guest, group)?;
        let cgroup = Cgroup::load(hierarchies::auto(), path.as_str());
        let cpuset = cgroup
            .controller_of::<CpuSetController>()
            .ok_or_else(|| missing_controller(&path, "cpuset.cpus"))?;
        cpuset
            .set_cpus(&cpus.to_string())
            .map_err(apply_err(&path, "cpuset.cpus"))
    }

    fn set_mems(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        nodes: &CpuMask,
    ) -> Result<()> {
        let path = self.thread_path(guest, group)?;
        let cgroup = Cgroup::load(hierarchies::auto(), path.as_str());
        let cpuset = cgroup
            .controller_of::<CpuSetController>()
            .ok_or_else(|| missing_controller(&path, "cpuset.mems"))?;
        cpuset
            .set_mems(&nodes.to_string())
            .map_err(apply_err(&path, "cpuset.mems"))
    }

    fn add_thread(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
        tid: Pid,
    ) -> Result<()> {
        let path = self.thread_path(guest, group)?;
        let cgroup = Cgroup::load(hierarchies::auto(), path.as_str());
        cgroup.add_task(CgroupPid::from(tid.as_raw() as u64)).map_err(|e| {
            CgroupsError::AddTaskToCgroup {
                path,
                tid: tid.as_raw(),
                source: e.into(),
            }
        })
    }

    fn remove_thread_group(
        &self,
        guest: &GuestName,
        group: ThreadGroup,
    ) -> Result<()> {
        Self::delete(&self.thread_path(guest, group)?)
    }

    fn remove_guest(&self, guest: &GuestName) -> Result<()> {
        let path = self.guest_path(guest);
        if Self::directories(&path).iter().all(|dir| !dir.is_dir()) {
            let _ = self.guests().remove(guest);
            return Ok(());
        }

        for child in Self::children(&path) {
            Self::delete(&format!("{path}/{child}"))?;
        }
        Self::delete(&path)?;

        let _ = self.guests().remove(guest);
        debug!("removed cgroup '{path}'");
        Ok(())
    }
}
