use super::{check_cancelled, match_events, reap_completed, Clustering, ReapedLot, ReconcileError};
use crate::storage::{EquipmentFilter, Storage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What one equipment contributed to a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EquipmentOutcome {
    pub events: usize,
    pub steps_advanced: usize,
    pub reaped: Vec<ReapedLot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub equipment: usize,
    pub failed_equipment: usize,
    pub steps_advanced: usize,
    pub reaped: Vec<ReapedLot>,
}

/// Runs reconciliation passes over every equipment in the store.
pub struct Reconciler {
    storage: Arc<dyn Storage>,
    clustering: Clustering,
}

impl Reconciler {
    pub fn new(storage: Arc<dyn Storage>, clustering: Clustering) -> Self {
        Self { storage, clustering }
    }

    /// One pass. A storage failure on one equipment is logged and the pass
    /// moves on; failing to list equipment abandons the pass.
    pub async fn run_pass(&self, shutdown: &watch::Receiver<bool>) -> Result<PassSummary, ReconcileError> {
        let started_at = Utc::now();
        let equipment = self.storage.list_equipment(&EquipmentFilter::default()).await?;

        let mut failed_equipment = 0;
        let mut steps_advanced = 0;
        let mut reaped = Vec::new();

        for eqp in &equipment {
            check_cancelled(shutdown)?;

            let mut outcome = EquipmentOutcome::default();
            let result = self.reconcile_equipment(&eqp.name, shutdown, &mut outcome).await;

            // Rows already changed count even when the equipment failed part way
            steps_advanced += outcome.steps_advanced;
            let lots_reaped = outcome.reaped.len();
            reaped.extend(outcome.reaped);

            match result {
                Ok(()) => {}
                Err(ReconcileError::Cancelled) => return Err(ReconcileError::Cancelled),
                Err(e) => {
                    failed_equipment += 1;
                    warn!(
                        equipment = %eqp.name,
                        steps_advanced = outcome.steps_advanced,
                        lots_reaped,
                        error = %e,
                        "Failed to reconcile equipment"
                    );
                }
            }
        }

        let summary = PassSummary {
            started_at,
            finished_at: Utc::now(),
            equipment: equipment.len(),
            failed_equipment,
            steps_advanced,
            reaped,
        };

        if summary.steps_advanced > 0 || !summary.reaped.is_empty() {
            info!(
                equipment = summary.equipment,
                steps_advanced = summary.steps_advanced,
                lots_reaped = summary.reaped.len(),
                failed_equipment = summary.failed_equipment,
                "Reconciliation pass complete"
            );
        } else {
            debug!(
                equipment = summary.equipment,
                failed_equipment = summary.failed_equipment,
                "Reconciliation pass found nothing to update"
            );
        }

        Ok(summary)
    }

    /// Matches and reaps for a single equipment. `outcome` holds whatever
    /// was done before an error.
    pub async fn reconcile_equipment(
        &self,
        equipment_id: &str,
        shutdown: &watch::Receiver<bool>,
        outcome: &mut EquipmentOutcome,
    ) -> Result<(), ReconcileError> {
        let events = self.storage.events_for_equipment(equipment_id).await?;
        outcome.events = events.len();

        let mut advanced = Vec::new();
        let matched = match_events(
            self.storage.as_ref(),
            equipment_id,
            &events,
            &self.clustering,
            shutdown,
            &mut advanced,
        )
        .await;
        outcome.steps_advanced = advanced.len();
        matched?;

        reap_completed(self.storage.as_ref(), equipment_id, &advanced, &mut outcome.reaped).await
    }
}
