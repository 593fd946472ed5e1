use super::{check_cancelled, Clustering, ReconcileError};
use crate::storage::{ActualEvent, StepRecord, Storage};
use tokio::sync::watch;
use tracing::{debug, info};

/// Advances pending steps on one equipment from its telemetry.
///
/// Events are visited cluster by cluster. An event whose track-in time is
/// already stamped on one of the lot's steps on this equipment has been
/// consumed and is skipped. Otherwise the lot's lowest pending step on the
/// equipment is marked processed at the event's track-in time. Steps that
/// transitioned are pushed to `advanced` as they happen, so they are still
/// there when the walk stops early on cancellation or a store error.
pub async fn match_events(
    storage: &dyn Storage,
    equipment_id: &str,
    events: &[ActualEvent],
    clustering: &Clustering,
    shutdown: &watch::Receiver<bool>,
    advanced: &mut Vec<StepRecord>,
) -> Result<(), ReconcileError> {
    for cluster in clustering.split(events) {
        for event in cluster {
            check_cancelled(shutdown)?;

            if let Some(step) = advance_for_event(storage, equipment_id, event).await? {
                advanced.push(step);
            }
        }
    }

    Ok(())
}

async fn advance_for_event(
    storage: &dyn Storage,
    equipment_id: &str,
    event: &ActualEvent,
) -> Result<Option<StepRecord>, ReconcileError> {
    let at = event.track_in_time;

    if storage
        .step_processed_at(equipment_id, &event.lot_id, at)
        .await?
        .is_some()
    {
        return Ok(None);
    }

    let pending = storage.pending_steps_for_lot(&event.lot_id, equipment_id).await?;
    if pending.is_empty() {
        debug!(
            equipment = %equipment_id,
            lot_id = %event.lot_id,
            track_in_time = %at,
            "No pending step for event"
        );
        return Ok(None);
    }

    for candidate in pending {
        // A track-in older than the batch belongs to an earlier assignment
        // of the lot.
        if candidate.created_at > at {
            debug!(
                equipment = %equipment_id,
                batch_id = %candidate.batch_id,
                lot_id = %candidate.lot_id,
                track_in_time = %at,
                created_at = %candidate.created_at,
                "Event predates batch"
            );
            continue;
        }

        if storage.mark_step_processed(&candidate, at).await? {
            info!(
                equipment = %equipment_id,
                batch_id = %candidate.batch_id,
                lot_id = %candidate.lot_id,
                carrier_id = %candidate.carrier_id,
                step = candidate.step,
                recipe_id = %candidate.recipe_id,
                next_equipment = %candidate.next_equipment_id,
                processed_at = %at,
                "Step processed"
            );
            return Ok(Some(StepRecord {
                processed: true,
                processed_at: Some(at),
                ..candidate
            }));
        }

        debug!(
            equipment = %equipment_id,
            batch_id = %candidate.batch_id,
            lot_id = %candidate.lot_id,
            step = candidate.step,
            "Step not advanced (earlier step pending or row gone)"
        );
    }

    Ok(None)
}
