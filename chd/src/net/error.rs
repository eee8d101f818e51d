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

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to open queues of interface '{ifname}': {source}")]
    Tap { ifname: String, source: anyhow::Error },
    #[error("failed to connect to VMM socket {socket}: {source}")]
    Connection { socket: PathBuf, source: std::io::Error },
    #[error("failed to encode interface '{ifname}': {source}")]
    Encode { ifname: String, source: serde_json::Error },
    #[error("failed to hand interface '{ifname}' to the VMM: {source}")]
    Transfer { ifname: String, source: std::io::Error },
    #[error("malformed response while adding interface '{ifname}': {response:?}")]
    Response { ifname: String, response: String },
    #[error("VMM rejected interface '{ifname}' with status {code}")]
    Rejected { ifname: String, code: u16 },
    #[error("link '{ifname}': {source}")]
    Link { ifname: String, source: anyhow::Error },
    #[error("network attach task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
