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

use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to connect to VMM socket {socket}: {source}")]
    Connection { socket: PathBuf, source: anyhow::Error },
    #[error("failed to launch VMM: {source}")]
    Launch { source: anyhow::Error },
    #[error("request '{endpoint}' timed out after {after:?}")]
    Timeout { endpoint: &'static str, after: Duration },
    #[error("request '{endpoint}' failed with status {code}: {message}")]
    Protocol { endpoint: &'static str, code: u16, message: String },
    #[error("malformed response to '{endpoint}': {source}")]
    Decode { endpoint: &'static str, source: anyhow::Error },
    #[error("failed to enumerate VMM threads: {source}")]
    Threads { source: anyhow::Error },
    #[error("failed to open event stream {path}: {source}")]
    EventStream { path: PathBuf, source: std::io::Error },
}
