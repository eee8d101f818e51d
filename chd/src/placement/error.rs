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

use crate::cgroups::CgroupsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("{what} is not supported on this host")]
    Unsupported { what: &'static str },
    #[error("operation not supported: {reason}")]
    UnsupportedOperation { reason: String },
    #[error(transparent)]
    Cgroups(#[from] CgroupsError),
    #[error("failed to set cpu affinity of thread {tid}: {source}")]
    Affinity { tid: i32, source: anyhow::Error },
    #[error("failed to set scheduler of thread {tid}: {source}")]
    Scheduler { tid: i32, source: anyhow::Error },
    #[error("failed to resolve host cpus: {source}")]
    HostCpus { source: anyhow::Error },
}
