use crate::batch::{self, BatchError, BatchPlan, BatchRequest};
use crate::progress::{ProgressBoard, ProgressProjector};
use crate::reconcile::{SchedulerHandle, SchedulerStatus};
use crate::storage::{BatchMember, DeletedRows, Equipment, EquipmentFilter, StepRecord, Storage, StorageError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub projector: Arc<ProgressProjector>,
    /// Absent when no scheduler runs in this process
    pub scheduler: Option<SchedulerHandle>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    /// Comma separated equipment types
    pub types: Option<String>,
    pub line: Option<String>,
}

impl ProgressQuery {
    fn filter(&self) -> EquipmentFilter {
        EquipmentFilter {
            types: self
                .types
                .as_deref()
                .map(|t| {
                    t.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            line: self.line.clone().filter(|l| !l.trim().is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NoteUpdate {
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NoteResponse {
    pub name: String,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub batch_id: String,
    pub steps: Vec<StepRecord>,
    pub members: Vec<BatchMember>,
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/progress?types=a,b&line=X
pub async fn get_progress(
    State(state): State<AppState>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ProgressBoard>, ApiError> {
    let board = state.projector.board(&query.filter()).await?;
    Ok(Json(board))
}

/// GET /api/equipment
pub async fn list_equipment(State(state): State<AppState>) -> Result<Json<Vec<Equipment>>, ApiError> {
    let equipment = state.storage.list_equipment(&EquipmentFilter::default()).await?;
    Ok(Json(equipment))
}

/// PUT /api/equipment/:name/note
pub async fn update_note(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<NoteUpdate>,
) -> Result<Json<NoteResponse>, ApiError> {
    let note = update.note.filter(|n| !n.trim().is_empty());

    if !state.storage.update_equipment_note(&name, note.as_deref()).await? {
        return Err(ApiError::NotFound(format!("equipment '{}' not found", name)));
    }

    info!(equipment = %name, "Equipment note updated");
    Ok(Json(NoteResponse { name, note }))
}

/// POST /api/batches
pub async fn create_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchPlan>), ApiError> {
    let plan = batch::create_batch(state.storage.as_ref(), &request, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// GET /api/batches/:batch_id
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchResponse>, ApiError> {
    let steps = state.storage.steps_for_batch(&batch_id).await?;
    let members = state.storage.batch_members(&batch_id).await?;

    if steps.is_empty() && members.is_empty() {
        return Err(ApiError::NotFound(format!("batch '{}' not found", batch_id)));
    }

    Ok(Json(BatchResponse {
        batch_id,
        steps,
        members,
    }))
}

/// DELETE /api/batches/:batch_id
///
/// Removes the batch whatever its processed state. Deleting a batch that is
/// already gone reports zero rows.
pub async fn delete_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<DeletedRows>, ApiError> {
    let deleted = state.storage.delete_batch(&batch_id).await?;
    info!(
        batch_id = %batch_id,
        steps_deleted = deleted.steps,
        members_deleted = deleted.members,
        "Batch deleted by operator"
    );
    Ok(Json(deleted))
}

/// GET /api/scheduler
pub async fn get_scheduler(State(state): State<AppState>) -> Result<Json<SchedulerStatus>, ApiError> {
    match &state.scheduler {
        Some(handle) => Ok(Json(handle.borrow().clone())),
        None => Err(ApiError::NotFound("scheduler is not running".to_string())),
    }
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::InternalError(e.to_string())
    }
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Storage(e) => ApiError::InternalError(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
