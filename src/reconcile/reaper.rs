use super::ReconcileError;
use crate::storage::{StepRecord, Storage};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

/// A (batch, lot) pair whose rows were deleted after its final step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapedLot {
    pub batch_id: String,
    pub lot_id: String,
    pub steps_deleted: usize,
    pub members_deleted: usize,
}

/// Deletes the step and member rows of every lot whose just-advanced step
/// has no successor in its batch. Only that lot is removed; other lots of
/// the batch keep their rows.
///
/// Lots that finished on `equipment_id` in an earlier pass but were never
/// removed (the pass failed or was cancelled after marking their final
/// step) are swept up here too. Each reaped lot is pushed to `reaped` as
/// soon as its rows are gone.
pub async fn reap_completed(
    storage: &dyn Storage,
    equipment_id: &str,
    advanced: &[StepRecord],
    reaped: &mut Vec<ReapedLot>,
) -> Result<(), ReconcileError> {
    let mut done: BTreeSet<(String, String)> = BTreeSet::new();

    for step in advanced {
        if done.contains(&lot_key(step)) {
            continue;
        }
        if storage.step_exists(&step.batch_id, &step.lot_id, step.step + 1).await? {
            continue;
        }

        reaped.push(reap_lot(storage, step).await?);
        done.insert(lot_key(step));
    }

    for step in storage.completed_lots(equipment_id).await? {
        if done.contains(&lot_key(&step)) {
            continue;
        }

        reaped.push(reap_lot(storage, &step).await?);
        done.insert(lot_key(&step));
    }

    Ok(())
}

fn lot_key(step: &StepRecord) -> (String, String) {
    (step.batch_id.clone(), step.lot_id.clone())
}

async fn reap_lot(storage: &dyn Storage, step: &StepRecord) -> Result<ReapedLot, ReconcileError> {
    let deleted = storage.delete_lot_from_batch(&step.batch_id, &step.lot_id).await?;
    info!(
        batch_id = %step.batch_id,
        lot_id = %step.lot_id,
        carrier_id = %step.carrier_id,
        final_step = step.step,
        steps_deleted = deleted.steps,
        members_deleted = deleted.members,
        "Lot completed its route, removed from batch"
    );

    Ok(ReapedLot {
        batch_id: step.batch_id.clone(),
        lot_id: step.lot_id.clone(),
        steps_deleted: deleted.steps,
        members_deleted: deleted.members,
    })
}
