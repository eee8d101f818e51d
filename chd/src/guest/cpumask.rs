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

use fancy_regex::Regex;
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

lazy_static! {
    // input should be a comma separated list of numbers with optional
    // ranges, or the empty string.
    static ref CPU_LIST_REGEX: Regex = {
        Regex::new(r"^(\d+(-\d+)?)?(,\d+(-\d+)?)*$").expect("regex construction")
    };
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid cpu list '{input}': {reason}")]
pub struct CpuMaskError {
    input: String,
    reason: &'static str,
}

/// A set of host CPU ids, written in the kernel's list syntax (`0-3,8`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuMask(BTreeSet<usize>);

impl CpuMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cpu in `0..count`.
    pub fn first(count: usize) -> Self {
        Self((0..count).collect())
    }

    pub fn set(&mut self, cpu: usize) {
        let _ = self.0.insert(cpu);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.0.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &CpuMask) -> CpuMask {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CpuMask) -> CpuMask {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Converts into the set the affinity syscalls take. Ids beyond what
    /// the kernel cpu set can hold are reported as errors.
    pub fn to_cpu_set(&self) -> nix::Result<nix::sched::CpuSet> {
        let mut set = nix::sched::CpuSet::new();
        for cpu in self.iter() {
            set.set(cpu)?;
        }
        Ok(set)
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for CpuMask {
    type Err = CpuMaskError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let err = |reason| CpuMaskError { input: input.to_string(), reason };

        if !CPU_LIST_REGEX.is_match(trimmed).unwrap_or(false) {
            return Err(err("expected a list like 0-3,8"));
        }

        let mut mask = CpuMask::new();
        for part in trimmed.split(',').filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (start, end),
                None => (part, part),
            };
            let start: usize =
                start.parse().map_err(|_| err("cpu id out of range"))?;
            let end: usize =
                end.parse().map_err(|_| err("cpu id out of range"))?;
            if end < start {
                return Err(err("range end is below its start"));
            }
            if end >= nix::sched::CpuSet::count() {
                return Err(err("cpu id beyond what the kernel supports"));
            }
            mask.0.extend(start..=end);
        }

        Ok(mask)
    }
}

impl Display for CpuMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut cpus = self.0.iter().copied().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                let _ = cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for CpuMask {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuMask {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
