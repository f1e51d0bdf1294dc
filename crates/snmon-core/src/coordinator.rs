use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    Automatic,
    Manual,
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollKind::Automatic => "automatic",
            PollKind::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollStatus {
    pub running: bool,
    pub kind: Option<PollKind>,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("a {running} poll is already in progress")]
pub struct PollConflict {
    pub running: PollKind,
}

pub trait PollLease: Send + Sync {
    /// Takes the lease for `kind`. Returns the kind of the current holder
    /// when someone else has it.
    fn acquire(&self, kind: PollKind) -> Result<Option<PollKind>, StoreError>;
    fn release(&self) -> Result<(), StoreError>;
    fn holder(&self) -> Result<Option<PollKind>, StoreError>;
}

#[derive(Clone, Default)]
pub struct PollCoordinator {
    current: Arc<Mutex<Option<PollKind>>>,
    lease: Option<Arc<dyn PollLease>>,
}

struct PollPermit<'a> {
    coordinator: &'a PollCoordinator,
}

impl Drop for PollPermit<'_> {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}

impl PollCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(lease: Arc<dyn PollLease>) -> Self {
        Self {
            current: Arc::default(),
            lease: Some(lease),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<PollKind>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, kind: PollKind) -> Result<(), PollKind> {
        let mut current = self.slot();
        if let Some(running) = *current {
            return Err(running);
        }
        if let Some(lease) = &self.lease {
            match lease.acquire(kind) {
                Ok(None) => {}
                Ok(Some(running)) => return Err(running),
                Err(err) => warn!(error = %err, "poll lease unavailable, guarding this process only"),
            }
        }
        *current = Some(kind);
        Ok(())
    }

    fn release(&self) {
        let mut current = self.slot();
        if current.take().is_none() {
            return;
        }
        if let Some(lease) = &self.lease {
            if let Err(err) = lease.release() {
                warn!(error = %err, "failed to release poll lease");
            }
        }
    }

    fn permit(&self, kind: PollKind) -> Result<PollPermit<'_>, PollKind> {
        self.claim(kind)?;
        Ok(PollPermit { coordinator: self })
    }

    pub async fn try_start(&self, kind: PollKind) -> bool {
        self.claim(kind).is_ok()
    }

    pub async fn end(&self) {
        self.release();
    }

    pub async fn status(&self) -> PollStatus {
        let local = *self.slot();
        let kind = local.or_else(|| {
            self.lease
                .as_ref()
                .and_then(|lease| lease.holder().ok().flatten())
        });
        PollStatus {
            running: kind.is_some(),
            kind,
        }
    }

    pub async fn automatic<F: Future>(&self, work: F) -> Option<F::Output> {
        let _permit = match self.permit(PollKind::Automatic) {
            Ok(permit) => permit,
            Err(running) => {
                info!(running = %running, "poll already in progress, skipping automatic cycle");
                return None;
            }
        };
        Some(work.await)
    }

    pub async fn manual<F: Future>(&self, work: F) -> Result<F::Output, PollConflict> {
        let _permit = self
            .permit(PollKind::Manual)
            .map_err(|running| PollConflict { running })?;
        Ok(work.await)
    }
}
