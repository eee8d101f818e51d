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

use crate::guest::GuestName;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CgroupsError>;

#[derive(Error, Debug)]
pub enum CgroupsError {
    #[error("cgroup '{path}' creation failed: {source}")]
    CreateCgroup { path: String, source: anyhow::Error },
    #[error("cgroup '{path}' failed to add task {tid}: {source}")]
    AddTaskToCgroup { path: String, tid: i32, source: anyhow::Error },
    #[error("cgroup '{path}' failed to apply {setting}: {source}")]
    Apply { path: String, setting: &'static str, source: anyhow::Error },
    #[error("cgroup '{path}' deletion failed: {source}")]
    DeleteCgroup { path: String, source: anyhow::Error },
    #[error("cgroup '{path}' is still busy")]
    Busy { path: String },
    #[error("guest '{guest}' has no cgroup")]
    NoGuestCgroup { guest: GuestName },
}
