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

pub use cpumask::{CpuMask, CpuMaskError};
pub use definition::{
    CpuPlacement, CpuTune, DiskDef, GuestDef, NetDef, NumaMode, NumaTune,
    SchedParam, SchedPolicy, VcpuDef,
};
pub use state::{GuestState, RunState, StateCell, StateReason};

use crate::monitor::MonitorHandle;
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};
use thiserror::Error;

mod cpumask;
mod definition;
mod state;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuestName(String);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid guest name '{0}': must be non-empty and contain no '/'")]
pub struct GuestNameError(String);

impl GuestName {
    /// Callers passing untrusted input should go through [str::parse].
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for GuestName {
    type Err = GuestNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains('/') || s == "." || s == ".." {
            return Err(GuestNameError(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl Display for GuestName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Paths the VMM reported for the guest's character devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolePaths {
    pub console: Option<PathBuf>,
    pub serial: Option<PathBuf>,
}

/// What gets persisted for a guest so a restarted driver can find it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub name: GuestName,
    pub def: GuestDef,
    pub state: GuestState,
    pub pid: Option<i32>,
    #[serde(default)]
    pub consoles: ConsolePaths,
    pub saved_at: DateTime<Utc>,
}

/// One guest and its mutable runtime data.
///
/// State changing operations are serialized by the job registry, the locks
/// here only protect individual fields.
#[derive(Debug)]
pub struct Guest {
    name: GuestName,
    def: RwLock<GuestDef>,
    state: Arc<StateCell>,
    pid: Mutex<Option<Pid>>,
    consoles: Mutex<ConsolePaths>,
    monitor: Mutex<Option<Arc<MonitorHandle>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Guest {
    pub fn new(name: GuestName, def: GuestDef) -> Self {
        Self {
            name,
            def: RwLock::new(def),
            state: Arc::new(StateCell::new(GuestState::new(
                RunState::NotCreated,
                StateReason::Unknown,
            ))),
            pid: Mutex::new(None),
            consoles: Mutex::new(ConsolePaths::default()),
            monitor: Mutex::new(None),
        }
    }

    /// Rebuilds a guest from its persisted record. No monitor is attached.
    pub fn from_record(record: GuestRecord) -> Self {
        let guest = Self::new(record.name, record.def);
        guest.state.set(record.state.state, record.state.reason);
        *lock(&guest.pid) = record.pid.map(Pid::from_raw);
        *lock(&guest.consoles) = record.consoles;
        guest
    }

    pub fn record(&self) -> GuestRecord {
        GuestRecord {
            name: self.name.clone(),
            def: self.def(),
            state: self.state(),
            pid: self.pid().map(Pid::as_raw),
            consoles: self.consoles(),
            saved_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &GuestName {
        &self.name
    }

    pub fn def(&self) -> GuestDef {
        self.def.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn update_def(&self, f: impl FnOnce(&mut GuestDef)) {
        let mut def =
            self.def.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut def)
    }

    pub fn state(&self) -> GuestState {
        self.state.get()
    }

    pub fn set_state(&self, state: RunState, reason: StateReason) {
        self.state.set(state, reason)
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.state.clone()
    }

    pub fn pid(&self) -> Option<Pid> {
        *lock(&self.pid)
    }

    pub fn set_pid(&self, pid: Option<Pid>) {
        *lock(&self.pid) = pid;
    }

    /// A guest is active while a VMM process is associated with it.
    pub fn is_active(&self) -> bool {
        self.pid().is_some()
    }

    pub fn consoles(&self) -> ConsolePaths {
        lock(&self.consoles).clone()
    }

    pub fn set_consoles(&self, consoles: ConsolePaths) {
        *lock(&self.consoles) = consoles;
    }

    pub fn monitor(&self) -> Option<Arc<MonitorHandle>> {
        lock(&self.monitor).clone()
    }

    pub fn set_monitor(&self, handle: Arc<MonitorHandle>) {
        *lock(&self.monitor) = Some(handle);
    }

    pub fn take_monitor(&self) -> Option<Arc<MonitorHandle>> {
        lock(&self.monitor).take()
    }
}

/// Every guest the driver knows about, keyed by name.
#[derive(Debug, Default)]
pub struct GuestList {
    guests: RwLock<HashMap<GuestName, Arc<Guest>>>,
}

impl GuestList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the guest, replacing any previous guest with the same name.
    pub fn insert(&self, guest: Arc<Guest>) {
        let _ = self
            .guests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(guest.name().clone(), guest);
    }

    pub fn get(&self, name: &GuestName) -> Option<Arc<Guest>> {
        self.guests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &GuestName) -> Option<Arc<Guest>> {
        self.guests.write().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    pub fn list(&self) -> Vec<Arc<Guest>> {
        let mut guests: Vec<_> = self
            .guests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        guests.sort_by(|a, b| a.name().cmp(b.name()));
        guests
    }

    /// Drops every guest without a VMM process and returns their names.
    pub fn remove_inactive(&self) -> Vec<GuestName> {
        let mut guests =
            self.guests.write().unwrap_or_else(PoisonError::into_inner);
        let inactive: Vec<GuestName> = guests
            .values()
            .filter(|guest| !guest.is_active())
            .map(|guest| guest.name().clone())
            .collect();
        for name in &inactive {
            let _ = guests.remove(name);
        }
        inactive
    }

    pub fn len(&self) -> usize {
        self.guests.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
