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
    cgroups::CgroupsError, guest::GuestName, host::StatusError, jobs::JobError,
    monitor::MonitorError, net::NetworkError, placement::PlacementError,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Cgroups(#[from] CgroupsError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("failed to prepare host devices of guest '{name}': {source}")]
    HostDevices { name: GuestName, source: anyhow::Error },
    #[error("failed to set affinity of guest '{name}': {source}")]
    Affinity { name: GuestName, source: anyhow::Error },
    #[error("guest '{name}' is already running")]
    AlreadyActive { name: GuestName },
    #[error("guest '{name}' is not running")]
    NotActive { name: GuestName },
}
