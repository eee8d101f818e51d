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

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use rtnetlink::Handle;
use std::fmt::Debug;
use tracing::trace;

/// Host network links.
#[async_trait]
pub trait LinkManager: Debug + Send + Sync {
    async fn index(&self, ifname: &str) -> anyhow::Result<u32>;

    async fn set_up(&self, ifname: &str) -> anyhow::Result<()>;
}

/// Links managed over an rtnetlink socket opened per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkLinks;

async fn link_index(handle: &Handle, ifname: &str) -> anyhow::Result<u32> {
    let mut links = handle.link().get().match_name(ifname.to_string()).execute();
    match links.try_next().await? {
        Some(link) => Ok(link.header.index),
        None => Err(anyhow!("iface '{ifname}' not found")),
    }
}

async fn with_handle<T, F, Fut>(f: F) -> anyhow::Result<T>
where
    F: FnOnce(Handle) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let (connection, handle, _) = rtnetlink::new_connection()?;
    let connection = tokio::spawn(connection);
    let result = f(handle).await;
    connection.abort();
    result
}

#[async_trait]
impl LinkManager for NetlinkLinks {
    async fn index(&self, ifname: &str) -> anyhow::Result<u32> {
        with_handle(|handle| async move { link_index(&handle, ifname).await })
            .await
    }

    async fn set_up(&self, ifname: &str) -> anyhow::Result<()> {
        with_handle(|handle| async move {
            let index = link_index(&handle, ifname).await?;
            handle.link().set(index).up().execute().await?;
            trace!("set link {ifname} up");
            Ok(())
        })
        .await
    }
}
