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

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tokio::sync::watch;

/// Lifecycle state of a guest as the driver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotCreated,
    Created,
    Booting,
    Running,
    Paused,
    ShuttingDown,
    ShutOff,
}

impl Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why the guest is in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    Unknown,
    Booted,
    Unpaused,
    User,
    /// Paused because the guest is on its way down.
    ShuttingDown,
    Shutdown,
    Destroyed,
    Failed,
    /// Changed by the driver itself while restarting.
    Daemon,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestState {
    pub state: RunState,
    pub reason: StateReason,
}

impl GuestState {
    pub fn new(state: RunState, reason: StateReason) -> Self {
        Self { state, reason }
    }

    /// Whether the guest is already gone or on its way down.
    pub fn is_finishing(&self) -> bool {
        matches!(self.state, RunState::ShuttingDown | RunState::ShutOff)
            || (self.state == RunState::Paused
                && self.reason == StateReason::ShuttingDown)
    }
}

/// Shared, observable run state.
///
/// Event consumers and the API path both write here. There is no ordering
/// between them: the last write wins.
#[derive(Debug)]
pub struct StateCell(watch::Sender<GuestState>);

impl StateCell {
    pub fn new(initial: GuestState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self(tx)
    }

    pub fn get(&self) -> GuestState {
        *self.0.borrow()
    }

    pub fn set(&self, state: RunState, reason: StateReason) {
        let _ = self.0.send_replace(GuestState::new(state, reason));
    }

    /// Only the state changes, the current reason is kept.
    pub fn set_state(&self, state: RunState) {
        self.0.send_modify(|current| current.state = state);
    }

    pub fn subscribe(&self) -> watch::Receiver<GuestState> {
        self.0.subscribe()
    }
}
