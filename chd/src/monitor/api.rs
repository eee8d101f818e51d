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

use super::error::{MonitorError, Result};
use crate::guest::GuestDef;
use hyper::{body::Bytes, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::Serialize;
use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::trace;

pub const API_ROOT: &str = "/api/v1";

/// Requests understood by the VMM's REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    VmmPing,
    VmmShutdown,
    VmCreate,
    VmBoot,
    VmShutdown,
    VmReboot,
    VmPause,
    VmResume,
    VmInfo,
    VmResize,
    VmDelete,
    VmAddNet,
}

impl Endpoint {
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::VmmPing => "vmm.ping",
            Endpoint::VmmShutdown => "vmm.shutdown",
            Endpoint::VmCreate => "vm.create",
            Endpoint::VmBoot => "vm.boot",
            Endpoint::VmShutdown => "vm.shutdown",
            Endpoint::VmReboot => "vm.reboot",
            Endpoint::VmPause => "vm.pause",
            Endpoint::VmResume => "vm.resume",
            Endpoint::VmInfo => "vm.info",
            Endpoint::VmResize => "vm.resize",
            Endpoint::VmDelete => "vm.delete",
            Endpoint::VmAddNet => "vm.add-net",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Endpoint::VmmPing | Endpoint::VmInfo => Method::GET,
            _ => Method::PUT,
        }
    }

    pub fn path(&self) -> String {
        format!("{API_ROOT}/{}", self.name())
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// HTTP over the VMM's unix socket. Every call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    socket: PathBuf,
    client: Client<UnixConnector>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { socket: socket.into(), client: Client::unix(), timeout }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn connection_err(&self, source: impl Into<anyhow::Error>) -> MonitorError {
        MonitorError::Connection {
            socket: self.socket.clone(),
            source: source.into(),
        }
    }

    pub async fn call(
        &self,
        endpoint: Endpoint,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes> {
        let uri: hyper::Uri =
            hyperlocal::Uri::new(&self.socket, &endpoint.path()).into();
        let request = Request::builder()
            .method(endpoint.method())
            .uri(uri)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| self.connection_err(e))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| self.connection_err(e))?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| self.connection_err(e))?;
            Ok::<_, MonitorError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| MonitorError::Timeout {
                endpoint: endpoint.name(),
                after: self.timeout,
            })??;

        trace!("{} {} -> {status}", endpoint.method(), endpoint.path());
        if !status.is_success() {
            return Err(MonitorError::Protocol {
                endpoint: endpoint.name(),
                code: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        Ok(body)
    }

    pub async fn put_json<T: Serialize>(
        &self,
        endpoint: Endpoint,
        body: &T,
    ) -> Result<Bytes> {
        let body = serde_json::to_vec(body).map_err(|e| MonitorError::Decode {
            endpoint: endpoint.name(),
            source: e.into(),
        })?;
        self.call(endpoint, Some(body)).await
    }
}

/// Body of `vm.create`. Network devices are never part of it, they are
/// added with their tap fds through `vm.add-net`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmConfig {
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    pub payload: PayloadConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    pub console: ConsoleConfig,
    pub serial: ConsoleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: usize,
    pub max_vcpus: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryConfig {
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadConfig {
    pub kernel: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleConfig {
    pub mode: &'static str,
}

impl From<&GuestDef> for VmConfig {
    fn from(def: &GuestDef) -> Self {
        let max_vcpus = def.max_vcpus().max(1);
        VmConfig {
            cpus: CpusConfig {
                boot_vcpus: def.boot_vcpus().clamp(1, max_vcpus),
                max_vcpus,
            },
            memory: MemoryConfig { size: def.memory_mib << 20 },
            payload: PayloadConfig {
                kernel: def.kernel.clone(),
                cmdline: (!def.cmdline.is_empty()).then(|| def.cmdline.join(" ")),
                initramfs: def.initramfs.clone(),
            },
            disks: def
                .disks
                .iter()
                .map(|disk| DiskConfig {
                    path: disk.path.clone(),
                    readonly: disk.read_only,
                })
                .collect(),
            console: ConsoleConfig { mode: "Pty" },
            serial: ConsoleConfig { mode: "Pty" },
        }
    }
}

/// Body of `vm.resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResizeConfig {
    pub desired_vcpus: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{DiskDef, VcpuDef};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn only_ping_and_info_are_reads() {
        assert_eq!(Endpoint::VmmPing.method(), Method::GET);
        assert_eq!(Endpoint::VmInfo.method(), Method::GET);
        assert_eq!(Endpoint::VmBoot.method(), Method::PUT);
        assert_eq!(Endpoint::VmAddNet.path(), "/api/v1/vm.add-net");
    }

    #[test]
    fn create_body_carries_cpus_memory_and_payload() {
        let mut offline = VcpuDef::new(1);
        offline.online = false;
        let def = GuestDef {
            memory_mib: 512,
            kernel: "/boot/vmlinux".into(),
            cmdline: vec!["console=hvc0".into(), "root=/dev/vda1".into()],
            vcpus: vec![VcpuDef::new(0), offline],
            disks: vec![DiskDef { path: "/img/disk.raw".into(), read_only: true }],
            ..Default::default()
        };

        let body = serde_json::to_value(VmConfig::from(&def)).expect("serialize");
        assert_eq!(
            body,
            json!({
                "cpus": {"boot_vcpus": 1, "max_vcpus": 2},
                "memory": {"size": 536870912u64},
                "payload": {
                    "kernel": "/boot/vmlinux",
                    "cmdline": "console=hvc0 root=/dev/vda1"
                },
                "disks": [{"path": "/img/disk.raw", "readonly": true}],
                "console": {"mode": "Pty"},
                "serial": {"mode": "Pty"}
            })
        );
    }
}
