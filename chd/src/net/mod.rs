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

//! Hands host tap interfaces to a VMM.
//!
//! Interfaces are never part of `vm.create`. Each one is added with
//! `vm.add-net` on a dedicated connection to the api socket, with its queue
//! descriptors attached, before the guest boots.

pub use error::{NetworkError, Result};
pub use link::{LinkManager, NetlinkLinks};
pub use tap::{TapProvider, TunTapProvider};

use crate::guest::NetDef;
use std::{
    io::ErrorKind,
    os::{fd::OwnedFd, unix::net::UnixStream},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};
use wire::NetPayload;

pub mod error;

mod link;
mod tap;
mod wire;

#[derive(Debug, Clone)]
pub struct NetworkAttacher {
    taps: Arc<dyn TapProvider>,
    links: Arc<dyn LinkManager>,
    timeout: Duration,
}

impl NetworkAttacher {
    pub fn new(
        taps: Arc<dyn TapProvider>,
        links: Arc<dyn LinkManager>,
        timeout: Duration,
    ) -> Self {
        Self { taps, links, timeout }
    }

    /// Adds every interface to the VMM behind `socket` and returns the
    /// host interface indexes. The first failure aborts the whole attach.
    pub async fn attach(&self, socket: &Path, nets: &[NetDef]) -> Result<Vec<u32>> {
        if nets.is_empty() {
            return Ok(vec![]);
        }

        let mut batch = Vec::with_capacity(nets.len());
        for net in nets {
            let fds = self
                .taps
                .open_queues(&net.ifname, net.queue_pairs())
                .map_err(|source| NetworkError::Tap {
                    ifname: net.ifname.clone(),
                    source,
                })?;
            batch.push((net.clone(), fds));
        }

        let socket = socket.to_path_buf();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || add_nets(&socket, timeout, batch))
            .await??;

        let mut indexes = Vec::with_capacity(nets.len());
        for net in nets {
            let index = self.links.index(&net.ifname).await.map_err(|source| {
                NetworkError::Link { ifname: net.ifname.clone(), source }
            })?;
            indexes.push(index);
        }
        info!("attached {} interface(s) to the VMM", nets.len());
        Ok(indexes)
    }

    pub async fn links_up(&self, nets: &[NetDef]) -> Result<()> {
        for net in nets {
            self.links.set_up(&net.ifname).await.map_err(|source| {
                NetworkError::Link { ifname: net.ifname.clone(), source }
            })?;
        }
        Ok(())
    }
}

fn payload(net: &NetDef) -> NetPayload {
    NetPayload {
        mac: net.mac.clone(),
        num_queues: net.queue_pairs() * 2,
        queue_size: net.queue_size,
        ip: net.ip,
        mask: net.mask,
        id: net.ifname.clone(),
    }
}

fn add_nets(
    socket: &Path,
    timeout: Duration,
    batch: Vec<(NetDef, Vec<OwnedFd>)>,
) -> Result<()> {
    let connection_err = |source| NetworkError::Connection {
        socket: socket.to_path_buf(),
        source,
    };
    let mut stream = UnixStream::connect(socket).map_err(connection_err)?;
    stream.set_read_timeout(Some(timeout)).map_err(connection_err)?;
    stream.set_write_timeout(Some(timeout)).map_err(connection_err)?;

    // remaining descriptors are closed when the batch drops on error
    for (net, fds) in batch {
        let ifname = net.ifname.clone();
        let body = serde_json::to_vec(&payload(&net)).map_err(|source| {
            NetworkError::Encode { ifname: ifname.clone(), source }
        })?;

        wire::send_with_fds(&mut stream, &wire::request(&body), fds).map_err(
            |source| NetworkError::Transfer { ifname: ifname.clone(), source },
        )?;

        let response = wire::read_response(&mut stream).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidData => NetworkError::Response {
                    ifname: ifname.clone(),
                    response: e.to_string(),
                },
                _ => NetworkError::Transfer { ifname: ifname.clone(), source: e },
            }
        })?;
        match response.code {
            200 | 204 => debug!("VMM accepted interface '{ifname}'"),
            code => return Err(NetworkError::Rejected { ifname, code }),
        }
    }
    Ok(())
}
