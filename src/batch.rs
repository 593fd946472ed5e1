//! Batch creation on behalf of operators.
//!
//! A batch is born atomically: every lot in the request gets one step record
//! per route entry, numbered from 1, plus a single member row.

use crate::storage::{BatchMember, Lot, Storage, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("a batch needs at least one lot")]
    NoLots,

    #[error("lot {0} has an empty route")]
    EmptyRoute(String),

    #[error("lot {0} appears more than once")]
    DuplicateLot(String),

    #[error("unknown lot: {0}")]
    UnknownLot(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub equipment_id: String,
    pub recipe_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotRoute {
    pub lot_id: String,
    pub steps: Vec<RouteStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub lots: Vec<LotRoute>,
}

/// A step record before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub lot_id: String,
    pub carrier_id: String,
    pub step: i32,
    pub equipment_id: String,
    pub recipe_id: String,
    pub next_equipment_id: String,
    pub qty: i32,
    pub technology: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<PlannedStep>,
    pub members: Vec<BatchMember>,
}

/// Batch ids are the creation time down to the millisecond.
pub fn batch_id_for(created_at: DateTime<Utc>) -> String {
    created_at.format("%Y%m%d%H%M%S%3f").to_string()
}

/// Expands resolved lots and their routes into step and member rows.
pub fn plan_batch(
    lots: &[(Lot, Vec<RouteStep>)],
    created_at: DateTime<Utc>,
) -> Result<BatchPlan, BatchError> {
    if lots.is_empty() {
        return Err(BatchError::NoLots);
    }

    let batch_id = batch_id_for(created_at);
    let mut seen = HashSet::new();
    let mut steps = Vec::new();
    let mut members = Vec::with_capacity(lots.len());

    for (lot, route) in lots {
        if !seen.insert(lot.lot_id.as_str()) {
            return Err(BatchError::DuplicateLot(lot.lot_id.clone()));
        }
        if route.is_empty() {
            return Err(BatchError::EmptyRoute(lot.lot_id.clone()));
        }

        for (index, route_step) in route.iter().enumerate() {
            let next_equipment_id = route
                .get(index + 1)
                .map(|next| next.equipment_id.clone())
                .unwrap_or_default();

            steps.push(PlannedStep {
                lot_id: lot.lot_id.clone(),
                carrier_id: lot.carrier_id.clone(),
                step: index as i32 + 1,
                equipment_id: route_step.equipment_id.clone(),
                recipe_id: route_step.recipe_id.clone(),
                next_equipment_id,
                qty: lot.qty,
                technology: lot.technology.clone(),
            });
        }

        members.push(BatchMember {
            batch_id: batch_id.clone(),
            lot_id: lot.lot_id.clone(),
            carrier_id: lot.carrier_id.clone(),
            qty: lot.qty,
            technology: lot.technology.clone(),
        });
    }

    Ok(BatchPlan {
        batch_id,
        created_at,
        steps,
        members,
    })
}

/// Resolves the requested lots against the store, plans the batch and
/// persists it.
pub async fn create_batch(
    storage: &dyn Storage,
    request: &BatchRequest,
    created_at: DateTime<Utc>,
) -> Result<BatchPlan, BatchError> {
    let mut resolved = Vec::with_capacity(request.lots.len());
    for route in &request.lots {
        let lot = storage
            .find_lot(&route.lot_id)
            .await?
            .ok_or_else(|| BatchError::UnknownLot(route.lot_id.clone()))?;
        resolved.push((lot, route.steps.clone()));
    }

    let plan = plan_batch(&resolved, created_at)?;
    storage.create_batch(&plan).await?;

    info!(
        batch_id = %plan.batch_id,
        lots = plan.members.len(),
        steps = plan.steps.len(),
        "Created batch"
    );

    Ok(plan)
}
