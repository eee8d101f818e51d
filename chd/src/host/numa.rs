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

use crate::guest::CpuMask;
use anyhow::Context;
use std::{fmt::Debug, path::PathBuf};

/// Host NUMA layout.
pub trait NumaTopology: Debug + Send + Sync {
    /// The union of the cpus belonging to the given nodes.
    fn nodeset_cpus(&self, nodes: &CpuMask) -> anyhow::Result<CpuMask>;
}

#[derive(Debug, Clone)]
pub struct SysfsNuma {
    root: PathBuf,
}

impl Default for SysfsNuma {
    fn default() -> Self {
        Self::new("/sys/devices/system/node")
    }
}

impl SysfsNuma {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl NumaTopology for SysfsNuma {
    fn nodeset_cpus(&self, nodes: &CpuMask) -> anyhow::Result<CpuMask> {
        let mut cpus = CpuMask::new();
        for node in nodes.iter() {
            let path = self.root.join(format!("node{node}")).join("cpulist");
            let list = std::fs::read_to_string(&path).with_context(|| {
                format!("failed to read cpus of numa node {node}")
            })?;
            let node_cpus: CpuMask = list.parse()?;
            cpus = cpus.union(&node_cpus);
        }
        Ok(cpus)
    }
}
