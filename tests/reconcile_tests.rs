//! Reconciliation scenarios against an in-memory DuckDB store.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use coordinator::batch::{plan_batch, BatchPlan, RouteStep};
use coordinator::config::{ConfigError, ReconcileConfig, SettingsSource};
use coordinator::reconcile::{Clustering, Reconciler, Scheduler, SchedulerState};
use coordinator::storage::{
    ActualEvent, BatchMember, DeletedRows, DuckDbStorage, Equipment, EquipmentFilter, Lot,
    ReservedBatch, StepRecord, Storage, StorageError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 11, 8, 0, 0).unwrap()
}

fn minutes(m: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(m)
}

async fn setup_storage(equipment: &[&str]) -> Arc<DuckDbStorage> {
    let storage = DuckDbStorage::in_memory().unwrap();
    storage.init_schema().await.unwrap();
    for name in equipment {
        storage
            .insert_equipment(&Equipment {
                name: name.to_string(),
                equipment_type: "Furnace".to_string(),
                line: "A".to_string(),
                note: None,
            })
            .await
            .unwrap();
    }
    Arc::new(storage)
}

fn lot(lot_id: &str) -> Lot {
    Lot {
        lot_id: lot_id.to_string(),
        carrier_id: format!("C-{}", lot_id),
        qty: 25,
        priority: 1,
        technology: "T8-HV".to_string(),
        target_equipment_id: String::new(),
        target_recipe_id: String::new(),
    }
}

async fn create_batch(storage: &DuckDbStorage, lots: &[(&str, &[&str])], at: DateTime<Utc>) -> BatchPlan {
    let resolved: Vec<_> = lots
        .iter()
        .map(|(lot_id, route)| {
            let steps = route
                .iter()
                .map(|e| RouteStep {
                    equipment_id: e.to_string(),
                    recipe_id: format!("{}-R", e),
                })
                .collect::<Vec<_>>();
            (lot(lot_id), steps)
        })
        .collect();
    let plan = plan_batch(&resolved, at).unwrap();
    storage.create_batch(&plan).await.unwrap();
    plan
}

async fn track_in(storage: &DuckDbStorage, equipment: &str, lot_id: &str, at: DateTime<Utc>) {
    storage
        .insert_event(&ActualEvent {
            id: 0,
            equipment_id: equipment.to_string(),
            lot_id: lot_id.to_string(),
            lot_type: "PS".to_string(),
            track_in_time: at,
            carrier_id: format!("C-{}", lot_id),
            qty: Some(25),
            recipe_id: String::new(),
            next_equipment_id: String::new(),
            location: String::new(),
            end_time: None,
        })
        .await
        .unwrap();
}

async fn run_pass(storage: Arc<dyn Storage>) -> coordinator::reconcile::PassSummary {
    let (_tx, rx) = watch::channel(false);
    Reconciler::new(storage, Clustering::default())
        .run_pass(&rx)
        .await
        .unwrap()
}

fn processed_steps(steps: &[StepRecord], lot_id: &str) -> Vec<i32> {
    steps
        .iter()
        .filter(|s| s.lot_id == lot_id && s.processed)
        .map(|s| s.step)
        .collect()
}

#[tokio::test]
async fn test_pass_is_idempotent() {
    let storage = setup_storage(&["E1", "E2", "E3"]).await;
    let plan = create_batch(&storage, &[("L1", &["E1", "E2", "E3"]), ("L2", &["E1", "E2"])], t0()).await;
    track_in(&storage, "E1", "L1", minutes(1)).await;
    track_in(&storage, "E1", "L2", minutes(2)).await;
    track_in(&storage, "E2", "L1", minutes(40)).await;

    let first = run_pass(storage.clone()).await;
    assert_eq!(first.steps_advanced, 3);
    let after_first = storage.steps_for_batch(&plan.batch_id).await.unwrap();

    let second = run_pass(storage.clone()).await;
    assert_eq!(second.steps_advanced, 0);
    assert!(second.reaped.is_empty());
    let after_second = storage.steps_for_batch(&plan.batch_id).await.unwrap();

    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_processed_steps_stay_contiguous() {
    let storage = setup_storage(&["E1", "E2", "E3"]).await;
    let plan = create_batch(&storage, &[("L1", &["E1", "E2", "E3", "E4"])], t0()).await;

    // Step 3 telemetry shows up before step 2 has been seen
    track_in(&storage, "E1", "L1", minutes(1)).await;
    track_in(&storage, "E3", "L1", minutes(90)).await;

    run_pass(storage.clone()).await;
    let steps = storage.steps_for_batch(&plan.batch_id).await.unwrap();
    assert_eq!(processed_steps(&steps, "L1"), vec![1]);

    track_in(&storage, "E2", "L1", minutes(45)).await;
    run_pass(storage.clone()).await;
    let steps = storage.steps_for_batch(&plan.batch_id).await.unwrap();
    // E2 is listed before E3, so both advance in the same pass
    assert_eq!(processed_steps(&steps, "L1"), vec![1, 2, 3]);

    let step3 = steps.iter().find(|s| s.step == 3).unwrap();
    assert_eq!(step3.processed_at, Some(minutes(90)));
}

#[tokio::test]
async fn test_completion_deletes_lot_rows_in_same_pass() {
    let storage = setup_storage(&["E1", "E2"]).await;
    let plan = create_batch(&storage, &[("L1", &["E1", "E2"])], t0()).await;
    track_in(&storage, "E1", "L1", minutes(1)).await;
    track_in(&storage, "E2", "L1", minutes(50)).await;

    let summary = run_pass(storage.clone()).await;

    assert_eq!(summary.steps_advanced, 2);
    assert_eq!(summary.reaped.len(), 1);
    assert_eq!(summary.reaped[0].lot_id, "L1");
    assert_eq!(summary.reaped[0].steps_deleted, 2);
    assert_eq!(summary.reaped[0].members_deleted, 1);
    assert!(storage.steps_for_batch(&plan.batch_id).await.unwrap().is_empty());
    assert!(storage.batch_members(&plan.batch_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_independent_reaping_per_lot() {
    let storage = setup_storage(&["E"]).await;
    let plan = create_batch(&storage, &[("L1", &["E", "E"]), ("L2", &["E"])], t0()).await;
    track_in(&storage, "E", "L2", minutes(1)).await;

    let summary = run_pass(storage.clone()).await;

    assert_eq!(summary.reaped.len(), 1);
    assert_eq!(summary.reaped[0].lot_id, "L2");

    let steps = storage.steps_for_batch(&plan.batch_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.lot_id == "L1" && !s.processed));

    let members = storage.batch_members(&plan.batch_id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].lot_id, "L1");
}

#[tokio::test]
async fn test_unmatched_event_changes_nothing() {
    let storage = setup_storage(&["E1", "E2"]).await;
    let plan = create_batch(&storage, &[("L1", &["E1"])], t0()).await;
    track_in(&storage, "E2", "L1", minutes(1)).await;
    track_in(&storage, "E1", "UNKNOWN", minutes(1)).await;

    let summary = run_pass(storage.clone()).await;

    assert_eq!(summary.steps_advanced, 0);
    assert_eq!(summary.failed_equipment, 0);
    let steps = storage.steps_for_batch(&plan.batch_id).await.unwrap();
    assert!(!steps[0].processed);
}

#[tokio::test]
async fn test_pass_over_empty_store() {
    let storage = setup_storage(&[]).await;
    let summary = run_pass(storage).await;
    assert_eq!(summary.equipment, 0);
    assert_eq!(summary.steps_advanced, 0);
}

/// Wraps the store to inject failures, stalls and concurrent deletions.
struct InterferingStorage {
    inner: Arc<DuckDbStorage>,
    fail_events_for: Option<String>,
    delete_batch_before_mark: bool,
    fail_step_exists_once: AtomicBool,
    cancel_after_mark: Option<watch::Sender<bool>>,
    stall_list_equipment: bool,
}

impl InterferingStorage {
    fn wrap(inner: Arc<DuckDbStorage>) -> Self {
        Self {
            inner,
            fail_events_for: None,
            delete_batch_before_mark: false,
            fail_step_exists_once: AtomicBool::new(false),
            cancel_after_mark: None,
            stall_list_equipment: false,
        }
    }
}

#[async_trait]
impl Storage for InterferingStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.inner.init_schema().await
    }
    async fn list_equipment(&self, filter: &EquipmentFilter) -> Result<Vec<Equipment>, StorageError> {
        if self.stall_list_equipment {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.list_equipment(filter).await
    }
    async fn equipment_types(&self) -> Result<Vec<String>, StorageError> {
        self.inner.equipment_types().await
    }
    async fn equipment_lines(&self) -> Result<Vec<String>, StorageError> {
        self.inner.equipment_lines().await
    }
    async fn insert_equipment(&self, equipment: &Equipment) -> Result<(), StorageError> {
        self.inner.insert_equipment(equipment).await
    }
    async fn update_equipment_note(&self, name: &str, note: Option<&str>) -> Result<bool, StorageError> {
        self.inner.update_equipment_note(name, note).await
    }
    async fn insert_lot(&self, lot: &Lot) -> Result<(), StorageError> {
        self.inner.insert_lot(lot).await
    }
    async fn find_lot(&self, lot_id: &str) -> Result<Option<Lot>, StorageError> {
        self.inner.find_lot(lot_id).await
    }
    async fn insert_event(&self, event: &ActualEvent) -> Result<i64, StorageError> {
        self.inner.insert_event(event).await
    }
    async fn events_for_equipment(&self, equipment_id: &str) -> Result<Vec<ActualEvent>, StorageError> {
        if self.fail_events_for.as_deref() == Some(equipment_id) {
            return Err(StorageError::Database("connection reset".to_string()));
        }
        self.inner.events_for_equipment(equipment_id).await
    }
    async fn pending_steps_for_lot(&self, lot_id: &str, equipment_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        self.inner.pending_steps_for_lot(lot_id, equipment_id).await
    }
    async fn mark_step_processed(&self, step: &StepRecord, processed_at: DateTime<Utc>) -> Result<bool, StorageError> {
        if self.delete_batch_before_mark {
            self.inner.delete_batch(&step.batch_id).await?;
        }
        let marked = self.inner.mark_step_processed(step, processed_at).await?;
        if let Some(tx) = &self.cancel_after_mark {
            let _ = tx.send(true);
        }
        Ok(marked)
    }
    async fn step_exists(&self, batch_id: &str, lot_id: &str, step: i32) -> Result<bool, StorageError> {
        if self.fail_step_exists_once.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Database("connection reset".to_string()));
        }
        self.inner.step_exists(batch_id, lot_id, step).await
    }
    async fn completed_lots(&self, equipment_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        self.inner.completed_lots(equipment_id).await
    }
    async fn step_processed_at(
        &self,
        equipment_id: &str,
        lot_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StepRecord>, StorageError> {
        self.inner.step_processed_at(equipment_id, lot_id, at).await
    }
    async fn reserved_batches(&self, equipment_id: &str, limit: usize) -> Result<Vec<ReservedBatch>, StorageError> {
        self.inner.reserved_batches(equipment_id, limit).await
    }
    async fn batch_steps_on_equipment(&self, batch_id: &str, equipment_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        self.inner.batch_steps_on_equipment(batch_id, equipment_id).await
    }
    async fn steps_for_batch(&self, batch_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        self.inner.steps_for_batch(batch_id).await
    }
    async fn batch_members(&self, batch_id: &str) -> Result<Vec<BatchMember>, StorageError> {
        self.inner.batch_members(batch_id).await
    }
    async fn create_batch(&self, plan: &BatchPlan) -> Result<(), StorageError> {
        self.inner.create_batch(plan).await
    }
    async fn delete_lot_from_batch(&self, batch_id: &str, lot_id: &str) -> Result<DeletedRows, StorageError> {
        self.inner.delete_lot_from_batch(batch_id, lot_id).await
    }
    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedRows, StorageError> {
        self.inner.delete_batch(batch_id).await
    }
}

#[tokio::test]
async fn test_failing_equipment_does_not_stop_pass() {
    let inner = setup_storage(&["E1", "E2"]).await;
    let plan = create_batch(&inner, &[("L1", &["E1"]), ("L2", &["E2", "E3"])], t0()).await;
    track_in(&inner, "E1", "L1", minutes(1)).await;
    track_in(&inner, "E2", "L2", minutes(1)).await;

    let storage = Arc::new(InterferingStorage {
        fail_events_for: Some("E1".to_string()),
        ..InterferingStorage::wrap(inner.clone())
    });
    let summary = run_pass(storage).await;

    assert_eq!(summary.equipment, 2);
    assert_eq!(summary.failed_equipment, 1);
    assert_eq!(summary.steps_advanced, 1);

    let steps = inner.steps_for_batch(&plan.batch_id).await.unwrap();
    assert_eq!(processed_steps(&steps, "L1"), Vec::<i32>::new());
    assert_eq!(processed_steps(&steps, "L2"), vec![1]);
}

#[tokio::test]
async fn test_batch_deleted_between_read_and_write() {
    let inner = setup_storage(&["E1"]).await;
    let plan = create_batch(&inner, &[("L1", &["E1"])], t0()).await;
    track_in(&inner, "E1", "L1", minutes(1)).await;

    let storage = Arc::new(InterferingStorage {
        delete_batch_before_mark: true,
        ..InterferingStorage::wrap(inner.clone())
    });
    let summary = run_pass(storage).await;

    assert_eq!(summary.failed_equipment, 0);
    assert_eq!(summary.steps_advanced, 0);
    assert!(summary.reaped.is_empty());
    assert!(inner.steps_for_batch(&plan.batch_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lot_finished_in_failed_pass_is_reaped_next_pass() {
    let inner = setup_storage(&["E1"]).await;
    let plan = create_batch(&inner, &[("L1", &["E1"])], t0()).await;
    track_in(&inner, "E1", "L1", minutes(1)).await;

    let storage = Arc::new(InterferingStorage {
        fail_step_exists_once: AtomicBool::new(true),
        ..InterferingStorage::wrap(inner.clone())
    });

    // The step is marked, then the completion check fails
    let first = run_pass(storage.clone()).await;
    assert_eq!(first.failed_equipment, 1);
    assert_eq!(first.steps_advanced, 1);
    assert!(first.reaped.is_empty());
    let steps = inner.steps_for_batch(&plan.batch_id).await.unwrap();
    assert_eq!(processed_steps(&steps, "L1"), vec![1]);

    let second = run_pass(storage.clone()).await;
    assert_eq!(second.failed_equipment, 0);
    assert_eq!(second.steps_advanced, 0);
    assert_eq!(second.reaped.len(), 1);
    assert_eq!(second.reaped[0].lot_id, "L1");
    assert!(inner.steps_for_batch(&plan.batch_id).await.unwrap().is_empty());
    assert!(inner.batch_members(&plan.batch_id).await.unwrap().is_empty());

    let third = run_pass(storage).await;
    assert!(third.reaped.is_empty());
}

#[tokio::test]
async fn test_lot_finished_in_cancelled_pass_is_reaped_next_pass() {
    let inner = setup_storage(&["E1"]).await;
    let plan = create_batch(&inner, &[("L1", &["E1"]), ("L2", &["E1"])], t0()).await;
    track_in(&inner, "E1", "L1", minutes(1)).await;
    track_in(&inner, "E1", "L2", minutes(2)).await;

    // Shutdown lands right after L1's step is marked
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let storage = Arc::new(InterferingStorage {
        cancel_after_mark: Some(cancel_tx),
        ..InterferingStorage::wrap(inner.clone())
    });
    let result = Reconciler::new(storage, Clustering::default())
        .run_pass(&cancel_rx)
        .await;
    assert!(result.is_err());

    let steps = inner.steps_for_batch(&plan.batch_id).await.unwrap();
    assert_eq!(processed_steps(&steps, "L1"), vec![1]);
    assert_eq!(processed_steps(&steps, "L2"), Vec::<i32>::new());

    let summary = run_pass(inner.clone()).await;
    assert_eq!(summary.steps_advanced, 1);
    let mut reaped: Vec<_> = summary.reaped.iter().map(|r| r.lot_id.as_str()).collect();
    reaped.sort();
    assert_eq!(reaped, vec!["L1", "L2"]);
    assert!(inner.steps_for_batch(&plan.batch_id).await.unwrap().is_empty());
    assert!(inner.batch_members(&plan.batch_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_old_event_does_not_advance_later_batch() {
    let storage = setup_storage(&["E1"]).await;
    create_batch(&storage, &[("L1", &["E1"])], t0()).await;
    track_in(&storage, "E1", "L1", minutes(1)).await;

    let first = run_pass(storage.clone()).await;
    assert_eq!(first.reaped.len(), 1);

    // Same lot planned again later; its old track-in must not count
    let again = create_batch(&storage, &[("L1", &["E1"])], minutes(120)).await;
    let second = run_pass(storage.clone()).await;
    assert_eq!(second.steps_advanced, 0);
    let steps = storage.steps_for_batch(&again.batch_id).await.unwrap();
    assert!(!steps[0].processed);

    track_in(&storage, "E1", "L1", minutes(125)).await;
    let third = run_pass(storage.clone()).await;
    assert_eq!(third.steps_advanced, 1);
    assert_eq!(third.reaped.len(), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_running_pass() {
    let inner = setup_storage(&["E1"]).await;
    let storage = Arc::new(InterferingStorage {
        stall_list_equipment: true,
        ..InterferingStorage::wrap(inner)
    });

    let settings = ReconcileConfig {
        warmup: Duration::ZERO,
        ..ReconcileConfig::default()
    };
    let source = Arc::new(ToggleSettings(RwLock::new(settings.clone())));
    let reconciler = Reconciler::new(storage, Clustering::default());
    let (scheduler, mut status) = Scheduler::new(reconciler, source, settings);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == SchedulerState::RunningPass),
    )
    .await
    .unwrap()
    .unwrap();

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    let status = status.borrow();
    assert_eq!(status.state, SchedulerState::Stopped);
    assert_eq!(status.passes, 0);
}

struct ToggleSettings(RwLock<ReconcileConfig>);

#[async_trait]
impl SettingsSource for ToggleSettings {
    async fn current(&self) -> Result<ReconcileConfig, ConfigError> {
        Ok(self.0.read().await.clone())
    }
}

#[tokio::test]
async fn test_disabled_flag_blocks_then_resumes_matching() {
    let storage = setup_storage(&["E1"]).await;
    let plan = create_batch(&storage, &[("L1", &["E1", "E1"])], t0()).await;
    track_in(&storage, "E1", "L1", minutes(1)).await;

    let disabled = ReconcileConfig {
        enabled: false,
        update_interval_seconds: 1,
        warmup: Duration::ZERO,
        disabled_backoff: Duration::from_millis(10),
        ..ReconcileConfig::default()
    };
    let settings = Arc::new(ToggleSettings(RwLock::new(disabled.clone())));
    let reconciler = Reconciler::new(storage.clone(), Clustering::default());
    let (scheduler, mut status) = Scheduler::new(reconciler, settings.clone(), disabled.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == SchedulerState::Disabled),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let steps = storage.steps_for_batch(&plan.batch_id).await.unwrap();
    assert!(steps.iter().all(|s| !s.processed));

    settings.0.write().await.enabled = true;
    tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.passes >= 1))
        .await
        .unwrap()
        .unwrap();

    let steps = storage.steps_for_batch(&plan.batch_id).await.unwrap();
    assert_eq!(processed_steps(&steps, "L1"), vec![1]);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(status.borrow().state, SchedulerState::Stopped);
}
