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

//! A stand-in for the cloud-hypervisor REST API, served on a unix socket.

use hyper::{
    server::conn::Http, service::service_fn, Body, Method, Request, Response,
    StatusCode,
};
use serde_json::json;
use std::{
    collections::HashMap,
    convert::Infallible,
    path::Path,
    sync::{Arc, Mutex},
};
use tokio::net::UnixListener;

#[derive(Debug)]
struct VmmState {
    requests: Vec<String>,
    vm_state: &'static str,
    failures: HashMap<String, u16>,
}

/// Records every request as `"<METHOD> <endpoint>"` and answers like a VMM
/// would. The VM state follows the lifecycle requests it receives.
#[derive(Debug, Clone)]
pub struct FakeVmm {
    state: Arc<Mutex<VmmState>>,
}

impl Default for FakeVmm {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(VmmState {
                requests: vec![],
                vm_state: "Created",
                failures: HashMap::new(),
            })),
        }
    }
}

impl FakeVmm {
    /// Makes `endpoint` answer with `code` from now on.
    pub fn fail(&self, endpoint: &str, code: u16) {
        let _ = self
            .state
            .lock()
            .expect("vmm state")
            .failures
            .insert(endpoint.to_string(), code);
    }

    pub fn set_vm_state(&self, vm_state: &'static str) {
        self.state.lock().expect("vmm state").vm_state = vm_state;
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().expect("vmm state").requests.clone()
    }

    pub fn count(&self, request: &str) -> usize {
        self.requests().iter().filter(|r| *r == request).count()
    }

    /// Starts answering on `socket`. Must be called inside a runtime.
    pub fn serve(&self, socket: &Path) -> std::io::Result<()> {
        let listener = UnixListener::bind(socket)?;
        let state = self.state.clone();
        let _ = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state.clone();
                let _ = tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        respond(state.clone(), request)
                    });
                    let _ = Http::new()
                        .http1_only(true)
                        .serve_connection(stream, service)
                        .await;
                });
            }
        });
        Ok(())
    }
}

async fn respond(
    state: Arc<Mutex<VmmState>>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let endpoint = request
        .uri()
        .path()
        .trim_start_matches("/api/v1/")
        .to_string();
    let _ = hyper::body::to_bytes(request.into_body()).await;

    let mut state = state.lock().expect("vmm state");
    state.requests.push(format!("{method} {endpoint}"));

    if let Some(code) = state.failures.get(&endpoint) {
        let status =
            StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Ok(reply(status, Body::from("injected failure")));
    }

    let response = match (method, endpoint.as_str()) {
        (Method::GET, "vmm.ping") => reply(
            StatusCode::OK,
            Body::from(json!({"version": "38.0.0", "pid": 1}).to_string()),
        ),
        (Method::GET, "vm.info") => reply(
            StatusCode::OK,
            Body::from(
                json!({
                    "config": {
                        "console": {"mode": "Pty", "file": "/dev/pts/7"},
                        "serial": {"mode": "Pty", "file": "/dev/pts/8"}
                    },
                    "state": state.vm_state
                })
                .to_string(),
            ),
        ),
        (Method::PUT, "vm.add-net") => reply(
            StatusCode::OK,
            Body::from(json!({"id": "_net0", "bdf": "0000:00:05.0"}).to_string()),
        ),
        (Method::PUT, endpoint) => {
            match endpoint {
                "vm.create" => state.vm_state = "Created",
                "vm.boot" | "vm.resume" | "vm.reboot" => state.vm_state = "Running",
                "vm.pause" => state.vm_state = "Paused",
                "vm.shutdown" => state.vm_state = "Shutdown",
                _ => {}
            }
            reply(StatusCode::NO_CONTENT, Body::empty())
        }
        _ => reply(StatusCode::NOT_FOUND, Body::empty()),
    };
    Ok(response)
}

fn reply(status: StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
