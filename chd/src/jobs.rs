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

use crate::guest::GuestName;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("guest '{name}' is busy with another job")]
    Busy { name: GuestName },
}

/// Per guest job tokens. Holding a [JobGuard] is what allows a task to
/// change a guest's state.
#[derive(Debug, Default)]
pub struct JobRegistry {
    tokens: Mutex<HashMap<GuestName, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `wait` for the guest's token.
    pub async fn acquire(
        &self,
        name: &GuestName,
        wait: Duration,
    ) -> Result<JobGuard, JobError> {
        let token = self.token(name);
        match tokio::time::timeout(wait, token.lock_owned()).await {
            Ok(guard) => {
                trace!("job acquired for guest '{name}'");
                Ok(JobGuard { name: name.clone(), _guard: guard })
            }
            Err(_) => Err(JobError::Busy { name: name.clone() }),
        }
    }

    /// Drops the token of a guest that is no longer managed. A token still
    /// held or waited on stays, so the guest keeps a single token.
    pub fn forget(&self, name: &GuestName) {
        let mut tokens =
            self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        if tokens.get(name).is_some_and(|token| Arc::strong_count(token) == 1) {
            let _ = tokens.remove(name);
        }
    }

    fn token(&self, name: &GuestName) -> Arc<tokio::sync::Mutex<()>> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.clone())
            .or_default()
            .clone()
    }
}

/// Releases the job token when dropped.
#[derive(Debug)]
pub struct JobGuard {
    name: GuestName,
    _guard: OwnedMutexGuard<()>,
}

impl JobGuard {
    pub fn name(&self) -> &GuestName {
        &self.name
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        trace!("job released for guest '{}'", self.name);
    }
}
