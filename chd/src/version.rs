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

use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

const VERSION_PREFIX: &str = "cloud-hypervisor ";

/// Oldest VMM release whose API this driver speaks: 0.9.0.
pub const MIN_VERSION: u64 = 9_000;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("failed to run '{binary} --version': {source}")]
    Exec { binary: String, source: std::io::Error },
    #[error("unexpected version output '{output}'")]
    Parse { output: String },
    #[error("cloud-hypervisor {found} is older than the minimum {minimum}")]
    UnsupportedVersion { found: String, minimum: String },
}

/// Renders an encoded version back as `major.minor.micro`.
pub fn display(version: u64) -> String {
    format!(
        "{}.{}.{}",
        version / 1_000_000,
        (version / 1_000) % 1_000,
        version % 1_000
    )
}

/// Parses the first line printed by `cloud-hypervisor --version` into
/// `1000000 * major + 1000 * minor + micro`.
///
/// Vendor builds print `cloud-hypervisor vendor/v32.0.131-...`, only the
/// part after the last `/` is looked at. Anything after the numbers is
/// ignored.
pub fn parse(output: &str) -> Result<u64, VersionError> {
    let err = || VersionError::Parse { output: output.trim().to_string() };

    let rest = output.trim().strip_prefix(VERSION_PREFIX).ok_or_else(err)?;
    let rest = match rest.rfind('/') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let rest = rest.strip_prefix('v').ok_or_else(err)?;

    let mut numbers = rest.splitn(3, '.');
    let major = leading_number(numbers.next()).ok_or_else(err)?;
    let minor = leading_number(numbers.next()).ok_or_else(err)?;
    let micro = leading_number(numbers.next()).unwrap_or(0);

    if minor >= 1_000 || micro >= 1_000 {
        return Err(err());
    }

    major
        .checked_mul(1_000_000)
        .and_then(|version| version.checked_add(minor * 1_000 + micro))
        .ok_or_else(err)
}

fn leading_number(part: Option<&str>) -> Option<u64> {
    let part = part?;
    let end =
        part.find(|c: char| !c.is_ascii_digit()).unwrap_or(part.len());
    part[..end].parse().ok()
}

pub fn check(version: u64) -> Result<(), VersionError> {
    if version < MIN_VERSION {
        return Err(VersionError::UnsupportedVersion {
            found: display(version),
            minimum: display(MIN_VERSION),
        });
    }
    Ok(())
}

/// Runs the VMM binary with `--version` and checks that it is new enough.
pub async fn probe(binary: &Path) -> Result<u64, VersionError> {
    let exec_err = |source| VersionError::Exec {
        binary: binary.display().to_string(),
        source,
    };

    let output = Command::new(binary)
        .arg("--version")
        .env("LC_ALL", "C")
        .output()
        .await
        .map_err(exec_err)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!("{} --version: {}", binary.display(), stdout.trim());

    let first_line = stdout.lines().next().unwrap_or_default();
    let version = parse(first_line)?;
    check(version)?;

    info!("using cloud-hypervisor {}", display(version));
    Ok(version)
}
