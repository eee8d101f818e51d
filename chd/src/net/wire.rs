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

//! Raw HTTP framing for `vm.add-net`. Tap descriptors travel as
//! `SCM_RIGHTS` on the first chunk of the request, which the hyper client
//! cannot do.

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde::Serialize;
use std::{
    io::{self, IoSlice, Read, Write},
    net::Ipv4Addr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::net::UnixStream,
};

const ADD_NET_PATH: &str = "/api/v1/vm.add-net";
const MAX_HEAD: usize = 8 * 1024;

/// Body of `vm.add-net`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(super) struct NetPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Both directions of every queue pair.
    pub num_queues: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Ipv4Addr>,
    pub id: String,
}

pub(super) fn request(payload: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "PUT {ADD_NET_PATH} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    request.extend_from_slice(payload);
    request
}

/// Writes the request with `fds` attached. The descriptors are closed
/// locally once the kernel accepted them.
pub(super) fn send_with_fds(
    stream: &mut UnixStream,
    request: &[u8],
    fds: Vec<OwnedFd>,
) -> io::Result<()> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let cmsgs = [ControlMessage::ScmRights(&raw)];

    let sent = sendmsg(
        stream.as_raw_fd(),
        &[IoSlice::new(request)],
        &cmsgs,
        MsgFlags::empty(),
        None::<&UnixAddr>,
    )
    .map_err(io::Error::from)?;
    drop(fds);

    stream.write_all(&request[sent..])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Response {
    pub code: u16,
    pub body: Vec<u8>,
}

fn malformed(head: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        String::from_utf8_lossy(head).into_owned(),
    )
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Status code and `Content-Length` of a response head.
fn parse_head(head: &str) -> Option<(u16, usize)> {
    let mut lines = head.split("\r\n");
    let mut status = lines.next()?.split_whitespace();
    if !status.next()?.starts_with("HTTP/") {
        return None;
    }
    let code = status.next()?.parse().ok()?;

    let mut length = 0;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                length = value.trim().parse().ok()?;
            }
        }
    }
    Some((code, length))
}

/// Reads one response. Bytes past its body are not expected since the
/// requests are strictly sequential.
pub(super) fn read_response(stream: &mut impl Read) -> io::Result<Response> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HEAD {
            return Err(malformed(&buf));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "VMM closed the connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| malformed(&buf[..head_end]))?;
    let (code, length) = parse_head(head).ok_or_else(|| malformed(&buf))?;

    let mut body = buf.split_off(head_end);
    if body.len() < length {
        let have = body.len();
        body.resize(length, 0);
        stream.read_exact(&mut body[have..])?;
    }
    body.truncate(length);

    Ok(Response { code, body })
}
