//! Read-only work progress view for operator displays.
//!
//! Per equipment, the first telemetry cluster is what is in process, the
//! second is what is waiting, and the oldest unprocessed batches are the
//! reserved slots. Nothing here writes to the store.

use crate::reconcile::Clustering;
use crate::storage::{ActualEvent, Equipment, EquipmentFilter, Lot, StepRecord, Storage, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const RESERVED_SLOTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessItem {
    pub carrier_id: String,
    pub lot_id: String,
    pub qty: i32,
    pub recipe_id: String,
    /// Empty when the lot has no further step
    pub next_equipment_id: String,
    pub location: String,
    pub track_in_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservedSlot {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ProcessItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquipmentProgress {
    pub name: String,
    pub line: String,
    pub note: Option<String>,
    pub in_process: Vec<ProcessItem>,
    pub waiting: Vec<ProcessItem>,
    /// Oldest first, at most three
    pub reserved: Vec<ReservedSlot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressBoard {
    /// Every equipment type and line, unfiltered, for filter widgets
    pub types: Vec<String>,
    pub lines: Vec<String>,
    pub equipment_by_type: BTreeMap<String, Vec<EquipmentProgress>>,
}

pub struct ProgressProjector {
    storage: Arc<dyn Storage>,
    clustering: Clustering,
}

impl ProgressProjector {
    pub fn new(storage: Arc<dyn Storage>, clustering: Clustering) -> Self {
        Self { storage, clustering }
    }

    pub async fn board(&self, filter: &EquipmentFilter) -> Result<ProgressBoard, StorageError> {
        let equipment = self.storage.list_equipment(filter).await?;
        let types = self.storage.equipment_types().await?;
        let lines = self.storage.equipment_lines().await?;

        let mut lots = LotCache::default();
        let mut equipment_by_type: BTreeMap<String, Vec<EquipmentProgress>> = BTreeMap::new();
        for eqp in &equipment {
            let progress = self.equipment_progress(eqp, &mut lots).await?;
            equipment_by_type
                .entry(eqp.equipment_type.clone())
                .or_default()
                .push(progress);
        }

        debug!(equipment = equipment.len(), "Built progress board");

        Ok(ProgressBoard {
            types,
            lines,
            equipment_by_type,
        })
    }

    async fn equipment_progress(
        &self,
        eqp: &Equipment,
        lots: &mut LotCache,
    ) -> Result<EquipmentProgress, StorageError> {
        let events = self.storage.events_for_equipment(&eqp.name).await?;
        let clusters = self.clustering.split(&events);

        let in_process = match clusters.first() {
            Some(cluster) => self.items_from_events(&eqp.name, cluster, lots).await?,
            None => Vec::new(),
        };
        let waiting = match clusters.get(1) {
            Some(cluster) => self.items_from_events(&eqp.name, cluster, lots).await?,
            None => Vec::new(),
        };

        let mut reserved = Vec::new();
        for batch in self.storage.reserved_batches(&eqp.name, RESERVED_SLOTS).await? {
            let steps = self
                .storage
                .batch_steps_on_equipment(&batch.batch_id, &eqp.name)
                .await?;
            reserved.push(ReservedSlot {
                batch_id: batch.batch_id,
                created_at: batch.created_at,
                items: items_from_steps(&steps),
            });
        }

        Ok(EquipmentProgress {
            name: eqp.name.clone(),
            line: eqp.line.clone(),
            note: eqp.note.clone(),
            in_process,
            waiting,
            reserved,
        })
    }

    async fn items_from_events(
        &self,
        equipment_id: &str,
        events: &[ActualEvent],
        lots: &mut LotCache,
    ) -> Result<Vec<ProcessItem>, StorageError> {
        let mut items = Vec::with_capacity(events.len());

        for event in events {
            let lot = lots.get(self.storage.as_ref(), &event.lot_id).await?;
            let consumed = self
                .storage
                .step_processed_at(equipment_id, &event.lot_id, event.track_in_time)
                .await?;
            items.push(item_from_event(event, lot.as_ref(), consumed.as_ref()));
        }

        items.sort_by(|a, b| a.lot_id.cmp(&b.lot_id));
        Ok(items)
    }
}

/// Event fields win; empty ones fall back to the lot record. The next-equipment
/// hint comes from the step this event advanced, when there is one.
fn item_from_event(event: &ActualEvent, lot: Option<&Lot>, step: Option<&StepRecord>) -> ProcessItem {
    ProcessItem {
        carrier_id: non_empty_or(&event.carrier_id, lot.map(|l| l.carrier_id.as_str())),
        lot_id: event.lot_id.clone(),
        qty: event.qty.or(lot.map(|l| l.qty)).unwrap_or(0),
        recipe_id: non_empty_or(&event.recipe_id, lot.map(|l| l.target_recipe_id.as_str())),
        next_equipment_id: step
            .map(|s| s.next_equipment_id.clone())
            .unwrap_or_else(|| event.next_equipment_id.clone()),
        location: event.location.clone(),
        track_in_time: Some(event.track_in_time),
        end_time: event.end_time,
    }
}

fn non_empty_or(value: &str, fallback: Option<&str>) -> String {
    if value.is_empty() {
        fallback.unwrap_or_default().to_string()
    } else {
        value.to_string()
    }
}

/// One item per lot: the lot's lowest unprocessed step on the equipment.
fn items_from_steps(steps: &[StepRecord]) -> Vec<ProcessItem> {
    let mut by_lot: BTreeMap<&str, &StepRecord> = BTreeMap::new();
    for step in steps.iter().filter(|s| !s.processed) {
        by_lot
            .entry(step.lot_id.as_str())
            .and_modify(|current| {
                if step.step < current.step {
                    *current = step;
                }
            })
            .or_insert(step);
    }

    by_lot
        .into_values()
        .map(|step| ProcessItem {
            carrier_id: step.carrier_id.clone(),
            lot_id: step.lot_id.clone(),
            qty: step.qty,
            recipe_id: step.recipe_id.clone(),
            next_equipment_id: step.next_equipment_id.clone(),
            location: String::new(),
            track_in_time: None,
            end_time: None,
        })
        .collect()
}

#[derive(Default)]
struct LotCache {
    lots: HashMap<String, Option<Lot>>,
}

impl LotCache {
    async fn get(&mut self, storage: &dyn Storage, lot_id: &str) -> Result<Option<Lot>, StorageError> {
        if let Some(lot) = self.lots.get(lot_id) {
            return Ok(lot.clone());
        }
        let lot = storage.find_lot(lot_id).await?;
        self.lots.insert(lot_id.to_string(), lot.clone());
        Ok(lot)
    }
}
