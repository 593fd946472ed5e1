use crate::batch::BatchPlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A piece of processing equipment. The note is owned by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub name: String,
    #[serde(rename = "type")]
    pub equipment_type: String,
    pub line: String,
    pub note: Option<String>,
}

/// Work-in-process lot awaiting assignment. Read-only for the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub lot_id: String,
    pub carrier_id: String,
    pub qty: i32,
    pub priority: i32,
    pub technology: String,
    pub target_equipment_id: String,
    pub target_recipe_id: String,
}

/// One step of one lot's route inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: i64,
    pub batch_id: String,
    pub lot_id: String,
    pub carrier_id: String,
    pub step: i32,
    pub equipment_id: String,
    pub recipe_id: String,
    /// Equipment of the following step, empty on the last step
    pub next_equipment_id: String,
    pub qty: i32,
    pub technology: String,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized summary row, one per (batch, lot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMember {
    pub batch_id: String,
    pub lot_id: String,
    pub carrier_id: String,
    pub qty: i32,
    pub technology: String,
}

/// Telemetry: a lot was tracked in at an equipment. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualEvent {
    /// Assigned by the store on insert
    pub id: i64,
    pub equipment_id: String,
    pub lot_id: String,
    pub lot_type: String,
    pub track_in_time: DateTime<Utc>,
    pub carrier_id: String,
    pub qty: Option<i32>,
    pub recipe_id: String,
    pub next_equipment_id: String,
    pub location: String,
    pub end_time: Option<DateTime<Utc>>,
}

/// An unprocessed batch waiting on a piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedBatch {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
}

/// Rows removed by a delete. Zero counts are a valid outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRows {
    pub steps: usize,
    pub members: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentFilter {
    /// Empty means every type
    pub types: Vec<String>,
    pub line: Option<String>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    // Equipment

    /// Equipment matching the filter, ordered by type then name.
    async fn list_equipment(&self, filter: &EquipmentFilter) -> Result<Vec<Equipment>, StorageError>;
    async fn equipment_types(&self) -> Result<Vec<String>, StorageError>;
    async fn equipment_lines(&self) -> Result<Vec<String>, StorageError>;
    async fn insert_equipment(&self, equipment: &Equipment) -> Result<(), StorageError>;
    /// Returns false when no equipment has that name.
    async fn update_equipment_note(&self, name: &str, note: Option<&str>) -> Result<bool, StorageError>;

    // Lots

    async fn insert_lot(&self, lot: &Lot) -> Result<(), StorageError>;
    async fn find_lot(&self, lot_id: &str) -> Result<Option<Lot>, StorageError>;

    // Telemetry

    /// Returns the id the store assigned.
    async fn insert_event(&self, event: &ActualEvent) -> Result<i64, StorageError>;
    /// Events tracked at an equipment, ordered by track-in time ascending.
    async fn events_for_equipment(&self, equipment_id: &str) -> Result<Vec<ActualEvent>, StorageError>;

    // Step records

    /// Unprocessed steps of a lot on an equipment, lowest step first. Ties
    /// between batches go to the older batch.
    async fn pending_steps_for_lot(
        &self,
        lot_id: &str,
        equipment_id: &str,
    ) -> Result<Vec<StepRecord>, StorageError>;

    /// Conditionally marks a step processed. The update only applies while the
    /// row still exists, is still unprocessed, and no lower step of the same
    /// (batch, lot) is unprocessed. Returns whether the row transitioned.
    async fn mark_step_processed(
        &self,
        step: &StepRecord,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn step_exists(&self, batch_id: &str, lot_id: &str, step: i32) -> Result<bool, StorageError>;

    /// Final steps on an equipment whose (batch, lot) has no unprocessed step
    /// left, ordered by batch then lot.
    async fn completed_lots(&self, equipment_id: &str) -> Result<Vec<StepRecord>, StorageError>;

    /// The step of a lot on an equipment that an event at `at` advanced, if any.
    async fn step_processed_at(
        &self,
        equipment_id: &str,
        lot_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StepRecord>, StorageError>;

    /// Distinct batches with unprocessed steps on an equipment, oldest first.
    async fn reserved_batches(
        &self,
        equipment_id: &str,
        limit: usize,
    ) -> Result<Vec<ReservedBatch>, StorageError>;

    /// Steps of a batch scheduled on an equipment, ordered by lot then step.
    async fn batch_steps_on_equipment(
        &self,
        batch_id: &str,
        equipment_id: &str,
    ) -> Result<Vec<StepRecord>, StorageError>;

    /// All steps of a batch, ordered by lot then step.
    async fn steps_for_batch(&self, batch_id: &str) -> Result<Vec<StepRecord>, StorageError>;

    // Batches

    async fn batch_members(&self, batch_id: &str) -> Result<Vec<BatchMember>, StorageError>;

    /// Inserts every step and member of the plan in one transaction.
    async fn create_batch(&self, plan: &BatchPlan) -> Result<(), StorageError>;

    /// Removes the steps and member row of one lot in one batch.
    async fn delete_lot_from_batch(&self, batch_id: &str, lot_id: &str) -> Result<DeletedRows, StorageError>;

    /// Removes a whole batch regardless of processed state.
    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedRows, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}
