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

use crate::guest::{GuestDef, GuestName};
use anyhow::{anyhow, Context};
use std::{
    collections::HashMap,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};

const VFIO_DRIVER: &str = "vfio-pci";

/// PCI devices passed through to guests.
pub trait HostDevices: Debug + Send + Sync {
    /// Detaches the guest's devices from their host drivers.
    fn prepare(&self, name: &GuestName, def: &GuestDef) -> anyhow::Result<()>;

    /// Hands the guest's devices back to their host drivers.
    fn reattach(&self, name: &GuestName, def: &GuestDef) -> anyhow::Result<()>;

    /// Marks the devices of an already running guest as in use, after a
    /// driver restart.
    fn update_active(
        &self,
        name: &GuestName,
        def: &GuestDef,
    ) -> anyhow::Result<()>;
}

/// Binds devices to `vfio-pci` through sysfs `driver_override`.
#[derive(Debug)]
pub struct VfioHostDevices {
    sysfs_pci: PathBuf,
    in_use: Mutex<HashMap<String, GuestName>>,
}

impl Default for VfioHostDevices {
    fn default() -> Self {
        Self::new("/sys/bus/pci")
    }
}

impl VfioHostDevices {
    pub fn new(sysfs_pci: impl Into<PathBuf>) -> Self {
        Self { sysfs_pci: sysfs_pci.into(), in_use: Mutex::new(HashMap::new()) }
    }

    fn device_dir(&self, addr: &str) -> PathBuf {
        self.sysfs_pci.join("devices").join(addr)
    }

    /// Reserves `addr` for the guest. Returns whether this call took the
    /// reservation, `false` when the guest already held it.
    fn claim(&self, name: &GuestName, addr: &str) -> anyhow::Result<bool> {
        let mut in_use =
            self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        match in_use.get(addr) {
            Some(owner) if owner != name => Err(anyhow!(
                "pci device {addr} is already in use by guest '{owner}'"
            )),
            Some(_) => Ok(false),
            None => {
                let _ = in_use.insert(addr.to_string(), name.clone());
                Ok(true)
            }
        }
    }

    /// Drops the guest's reservation of `addr`. Returns `false` when
    /// another guest holds the device.
    fn release(&self, name: &GuestName, addr: &str) -> bool {
        let mut in_use =
            self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        match in_use.get(addr) {
            Some(owner) if owner != name => false,
            _ => {
                let _ = in_use.remove(addr);
                true
            }
        }
    }

    fn bind(&self, addr: &str, driver_override: &str) -> anyhow::Result<()> {
        let dir = self.device_dir(addr);
        if !dir.exists() {
            return Err(anyhow!("pci device {addr} does not exist"));
        }

        write_sysfs(&dir.join("driver_override"), driver_override)?;
        if dir.join("driver").exists() {
            write_sysfs(&dir.join("driver").join("unbind"), addr)?;
        }
        write_sysfs(&self.sysfs_pci.join("drivers_probe"), addr)
    }
}

fn write_sysfs(path: &Path, value: &str) -> anyhow::Result<()> {
    std::fs::write(path, value)
        .with_context(|| format!("failed to write '{value}' to {}", path.display()))
}

impl HostDevices for VfioHostDevices {
    fn prepare(&self, name: &GuestName, def: &GuestDef) -> anyhow::Result<()> {
        for (idx, addr) in def.host_devices.iter().enumerate() {
            let prepared = self.claim(name, addr).and_then(|claimed| {
                self.bind(addr, VFIO_DRIVER).map_err(|e| {
                    if claimed {
                        let _ = self.release(name, addr);
                    }
                    e
                })
            });
            if let Err(e) = prepared {
                // undo what was already detached for this guest
                for done in &def.host_devices[..idx] {
                    let _best_effort = self.bind(done, "\n");
                    let _ = self.release(name, done);
                }
                return Err(e);
            }
            debug!("pci device {addr} detached for guest '{name}'");
        }
        Ok(())
    }

    fn reattach(&self, name: &GuestName, def: &GuestDef) -> anyhow::Result<()> {
        let mut first_err = None;
        for addr in &def.host_devices {
            if !self.release(name, addr) {
                warn!(
                    "pci device {addr} is held by another guest, not reattaching it for '{name}'"
                );
                continue;
            }
            if let Err(e) = self.bind(addr, "\n") {
                warn!("failed to reattach pci device {addr} of guest '{name}': {e:#}");
                let _ = first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn update_active(
        &self,
        name: &GuestName,
        def: &GuestDef,
    ) -> anyhow::Result<()> {
        for addr in &def.host_devices {
            let _ = self.claim(name, addr)?;
        }
        Ok(())
    }
}
