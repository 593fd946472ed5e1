//! Reconciliation of pending batch steps against equipment telemetry.
//!
//! A pass walks every equipment: its events are clustered by time, each event
//! advances at most one pending step of its lot on that equipment, and lots
//! whose final step was just advanced have their batch rows deleted.

pub mod cluster;
pub mod matcher;
pub mod pass;
pub mod reaper;
pub mod scheduler;

use crate::storage::StorageError;
use thiserror::Error;

pub use cluster::{cluster_events, Clustering};
pub use matcher::match_events;
pub use pass::{EquipmentOutcome, PassSummary, Reconciler};
pub use reaper::{reap_completed, ReapedLot};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerState, SchedulerStatus};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

/// Returns `Cancelled` once shutdown has been signalled.
pub(crate) fn check_cancelled(shutdown: &tokio::sync::watch::Receiver<bool>) -> Result<(), ReconcileError> {
    if *shutdown.borrow() {
        Err(ReconcileError::Cancelled)
    } else {
        Ok(())
    }
}
