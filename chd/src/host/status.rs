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

use crate::guest::{GuestName, GuestRecord};
use std::{
    fmt::Debug,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("failed to write status of guest '{name}': {source}")]
    Write { name: GuestName, source: std::io::Error },
    #[error("failed to encode status of guest '{name}': {source}")]
    Encode { name: GuestName, source: serde_json::Error },
    #[error("failed to remove status of guest '{name}': {source}")]
    Remove { name: GuestName, source: std::io::Error },
    #[error("failed to read status directory {dir}: {source}")]
    Read { dir: PathBuf, source: walkdir::Error },
}

/// Persistent per guest status, the input of reconnection.
pub trait StatusStore: Debug + Send + Sync {
    fn save(&self, record: &GuestRecord) -> Result<(), StatusError>;

    /// Loads every readable record. Unreadable ones are skipped.
    fn load_all(&self) -> Result<Vec<GuestRecord>, StatusError>;

    /// Removes the guest's status files. Missing files are not an error.
    fn remove(&self, name: &GuestName) -> Result<(), StatusError>;
}

/// One JSON file per guest in the state directory, next to the VMM's
/// pid file.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn status_path(&self, name: &GuestName) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn pid_path(&self, name: &GuestName) -> PathBuf {
        self.dir.join(format!("{name}.pid"))
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl StatusStore for FileStatusStore {
    fn save(&self, record: &GuestRecord) -> Result<(), StatusError> {
        let name = &record.name;
        let json = serde_json::to_vec_pretty(record).map_err(|source| {
            StatusError::Encode { name: name.clone(), source }
        })?;

        let write_err =
            |source| StatusError::Write { name: name.clone(), source };
        std::fs::create_dir_all(&self.dir).map_err(write_err)?;

        // readers never observe a half written file
        let path = self.status_path(name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;

        debug!("saved status of guest '{name}' to {}", path.display());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<GuestRecord>, StatusError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut records = vec![];
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|source| StatusError::Read {
                dir: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let parsed = std::fs::read(path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| {
                    serde_json::from_slice::<GuestRecord>(&raw)
                        .map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("ignoring unreadable status {}: {e:#}", path.display())
                }
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn remove(&self, name: &GuestName) -> Result<(), StatusError> {
        for path in [self.status_path(name), self.pid_path(name)] {
            remove_if_present(&path).map_err(|source| StatusError::Remove {
                name: name.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
