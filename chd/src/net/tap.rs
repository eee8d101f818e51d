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

use anyhow::{anyhow, Context};
use std::{
    fmt::Debug,
    fs::OpenOptions,
    os::fd::{AsRawFd, OwnedFd},
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
};
use tracing::debug;

/// Opens the queue descriptors of host tap interfaces.
pub trait TapProvider: Debug + Send + Sync {
    /// One descriptor per queue pair of `ifname`.
    fn open_queues(&self, ifname: &str, queues: usize)
        -> anyhow::Result<Vec<OwnedFd>>;
}

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

nix::ioctl_write_ptr_bad!(
    tunsetiff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    IfReq
);

fn tap_flags(queues: usize) -> libc::c_short {
    let mut flags = libc::IFF_TAP | libc::IFF_NO_PI | libc::IFF_VNET_HDR;
    if queues > 1 {
        flags |= libc::IFF_MULTI_QUEUE;
    }
    flags as libc::c_short
}

fn ifreq(ifname: &str, queues: usize) -> anyhow::Result<IfReq> {
    if ifname.is_empty() || ifname.len() >= libc::IFNAMSIZ {
        return Err(anyhow!("invalid interface name '{ifname}'"));
    }
    let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, src) in name.iter_mut().zip(ifname.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(IfReq { name, flags: tap_flags(queues), _pad: [0; 22] })
}

/// Attaches to existing taps through the tun clone device.
#[derive(Debug, Clone)]
pub struct TunTapProvider {
    device: PathBuf,
}

impl Default for TunTapProvider {
    fn default() -> Self {
        Self { device: PathBuf::from("/dev/net/tun") }
    }
}

impl TapProvider for TunTapProvider {
    fn open_queues(
        &self,
        ifname: &str,
        queues: usize,
    ) -> anyhow::Result<Vec<OwnedFd>> {
        let req = ifreq(ifname, queues)?;
        let mut fds = Vec::with_capacity(queues);
        for queue in 0..queues {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
                .open(&self.device)
                .with_context(|| format!("failed to open {}", self.device.display()))?;
            // SAFETY: `req` is a properly sized and initialized ifreq and
            // the descriptor is open for the duration of the call.
            let _ = unsafe { tunsetiff(file.as_raw_fd(), &req) }
                .with_context(|| format!("TUNSETIFF on '{ifname}' queue {queue}"))?;
            fds.push(OwnedFd::from(file));
        }
        debug!("opened {queues} queue(s) of tap '{ifname}'");
        Ok(fds)
    }
}
