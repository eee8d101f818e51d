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

use crate::guest::{ConsolePaths, RunState};
use serde::Deserialize;
use std::path::PathBuf;

/// States reported by `vm.info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VmState {
    Created,
    Running,
    Shutdown,
    Paused,
    BreakPoint,
}

impl From<VmState> for RunState {
    fn from(state: VmState) -> Self {
        match state {
            VmState::Created => RunState::Created,
            VmState::Running => RunState::Running,
            VmState::Shutdown => RunState::ShutOff,
            VmState::Paused | VmState::BreakPoint => RunState::Paused,
        }
    }
}

/// Response of `vm.info`. Only the fields the driver acts on are typed, the
/// rest of the configuration echo is kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VmInfo {
    pub state: VmState,
    pub config: serde_json::Value,
    #[serde(default)]
    pub memory_actual_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceConfig {
    #[serde(default)]
    file: Option<PathBuf>,
}

impl VmInfo {
    pub fn run_state(&self) -> RunState {
        self.state.into()
    }

    fn device_file(&self, key: &str) -> Option<PathBuf> {
        let device = self.config.get(key)?.clone();
        serde_json::from_value::<DeviceConfig>(device).ok()?.file
    }

    /// Pty paths the VMM allocated for the console and serial port.
    pub fn consoles(&self) -> ConsolePaths {
        ConsolePaths {
            console: self.device_file("console"),
            serial: self.device_file("serial"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_state_and_pty_paths() {
        let info: VmInfo = serde_json::from_str(
            r#"{
                "config": {
                    "cpus": {"boot_vcpus": 2},
                    "console": {"mode": "Pty", "file": "/dev/pts/3"},
                    "serial": {"mode": "Pty", "file": "/dev/pts/4"}
                },
                "state": "Running",
                "memory_actual_size": 1073741824
            }"#,
        )
        .expect("valid info");

        assert_eq!(info.run_state(), RunState::Running);
        assert_eq!(
            info.consoles(),
            ConsolePaths {
                console: Some("/dev/pts/3".into()),
                serial: Some("/dev/pts/4".into()),
            }
        );
    }

    #[test]
    fn breakpoints_look_paused() {
        let info: VmInfo =
            serde_json::from_str(r#"{"config": {}, "state": "BreakPoint"}"#)
                .expect("valid info");
        assert_eq!(info.run_state(), RunState::Paused);
        assert_eq!(info.consoles(), ConsolePaths::default());
    }

    #[test]
    fn unknown_states_do_not_decode() {
        assert!(serde_json::from_str::<VmInfo>(
            r#"{"config": {}, "state": "Exploded"}"#
        )
        .is_err());
        assert!(serde_json::from_str::<VmInfo>(r#"{"state": "Running"}"#).is_err());
    }
}
