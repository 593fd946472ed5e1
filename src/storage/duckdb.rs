use super::traits::{
    ActualEvent, BatchMember, DeletedRows, Equipment, EquipmentFilter, Lot, ReservedBatch,
    StepRecord, Storage, StorageError,
};
use crate::batch::BatchPlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STEP_COLUMNS: &str = "id, batch_id, lot_id, carrier_id, step, equipment_id, recipe_id, \
     next_equipment_id, qty, technology, processed, epoch_us(processed_at), epoch_us(created_at)";

const EVENT_COLUMNS: &str = "id, equipment_id, lot_id, lot_type, epoch_us(track_in_time), carrier_id, \
     qty, recipe_id, next_equipment_id, location, epoch_us(end_time)";

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the holder PID from a DuckDB lock error, e.g. "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale database file");
        }
    }
    Ok(())
}

fn micros_to_datetime(idx: usize, micros: i64) -> duckdb::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            idx,
            duckdb::types::Type::BigInt,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid timestamp",
            )),
        )
    })
}

fn optional_datetime(idx: usize, micros: Option<i64>) -> duckdb::Result<Option<DateTime<Utc>>> {
    micros.map(|m| micros_to_datetime(idx, m)).transpose()
}

fn step_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<StepRecord> {
    Ok(StepRecord {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        lot_id: row.get(2)?,
        carrier_id: row.get(3)?,
        step: row.get(4)?,
        equipment_id: row.get(5)?,
        recipe_id: row.get(6)?,
        next_equipment_id: row.get(7)?,
        qty: row.get(8)?,
        technology: row.get(9)?,
        processed: row.get(10)?,
        processed_at: optional_datetime(11, row.get(11)?)?,
        created_at: micros_to_datetime(12, row.get(12)?)?,
    })
}

fn event_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<ActualEvent> {
    Ok(ActualEvent {
        id: row.get(0)?,
        equipment_id: row.get(1)?,
        lot_id: row.get(2)?,
        lot_type: row.get(3)?,
        track_in_time: micros_to_datetime(4, row.get(4)?)?,
        carrier_id: row.get(5)?,
        qty: row.get(6)?,
        recipe_id: row.get(7)?,
        next_equipment_id: row.get(8)?,
        location: row.get(9)?,
        end_time: optional_datetime(10, row.get(10)?)?,
    })
}

fn equipment_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Equipment> {
    Ok(Equipment {
        name: row.get(0)?,
        equipment_type: row.get(1)?,
        line: row.get(2)?,
        note: row.get(3)?,
    })
}

fn query_steps(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<StepRecord>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, step_from_row)?;

    let mut steps = Vec::new();
    for row in rows {
        steps.push(row?);
    }
    Ok(steps)
}

fn query_strings(conn: &Connection, sql: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// DuckDB implementation of the Storage trait
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    /// Open (or create) a database file, clearing a lock left behind by a
    /// process that no longer exists.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!(error = %error_msg, "Database lock detected");
                let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
                    return Err(e.into());
                };
                if is_process_running(pid) {
                    tracing::error!(pid, "Lock holder is still running");
                    return Err(e.into());
                }

                tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
                remove_lock_files(path)
                    .map_err(|io_err| StorageError::Database(io_err.to_string()))?;
                Connection::open(path)?
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE SEQUENCE IF NOT EXISTS step_records_id_seq START 1;
                 CREATE SEQUENCE IF NOT EXISTS actual_events_id_seq START 1;

                 CREATE TABLE IF NOT EXISTS equipment (
                     name VARCHAR PRIMARY KEY,
                     equipment_type VARCHAR NOT NULL,
                     line VARCHAR NOT NULL,
                     note VARCHAR
                 );
                 CREATE INDEX IF NOT EXISTS idx_equipment_type_line ON equipment(equipment_type, line);

                 CREATE TABLE IF NOT EXISTS lots (
                     lot_id VARCHAR PRIMARY KEY,
                     carrier_id VARCHAR NOT NULL,
                     qty INTEGER NOT NULL,
                     priority INTEGER NOT NULL,
                     technology VARCHAR NOT NULL,
                     target_equipment_id VARCHAR NOT NULL,
                     target_recipe_id VARCHAR NOT NULL
                 );

                 CREATE TABLE IF NOT EXISTS step_records (
                     id BIGINT PRIMARY KEY DEFAULT nextval('step_records_id_seq'),
                     batch_id VARCHAR NOT NULL,
                     lot_id VARCHAR NOT NULL,
                     carrier_id VARCHAR NOT NULL,
                     step INTEGER NOT NULL,
                     equipment_id VARCHAR NOT NULL,
                     recipe_id VARCHAR NOT NULL,
                     next_equipment_id VARCHAR NOT NULL,
                     qty INTEGER NOT NULL,
                     technology VARCHAR NOT NULL,
                     processed BOOLEAN NOT NULL DEFAULT FALSE,
                     processed_at TIMESTAMP,
                     created_at TIMESTAMP NOT NULL,
                     UNIQUE (batch_id, lot_id, step)
                 );
                 CREATE INDEX IF NOT EXISTS idx_steps_batch_equipment ON step_records(batch_id, equipment_id);
                 CREATE INDEX IF NOT EXISTS idx_steps_lot_equipment ON step_records(lot_id, equipment_id);

                 CREATE TABLE IF NOT EXISTS batch_members (
                     batch_id VARCHAR NOT NULL,
                     lot_id VARCHAR NOT NULL,
                     carrier_id VARCHAR NOT NULL,
                     qty INTEGER NOT NULL,
                     technology VARCHAR NOT NULL,
                     PRIMARY KEY (batch_id, lot_id)
                 );

                 CREATE TABLE IF NOT EXISTS actual_events (
                     id BIGINT PRIMARY KEY DEFAULT nextval('actual_events_id_seq'),
                     equipment_id VARCHAR NOT NULL,
                     lot_id VARCHAR NOT NULL,
                     lot_type VARCHAR NOT NULL,
                     track_in_time TIMESTAMP NOT NULL,
                     carrier_id VARCHAR NOT NULL,
                     qty INTEGER,
                     recipe_id VARCHAR NOT NULL,
                     next_equipment_id VARCHAR NOT NULL,
                     location VARCHAR NOT NULL,
                     end_time TIMESTAMP
                 );
                 CREATE INDEX IF NOT EXISTS idx_events_equipment_time ON actual_events(equipment_id, track_in_time);",
            )?;
            Ok(())
        })
        .await
    }

    async fn list_equipment(&self, filter: &EquipmentFilter) -> Result<Vec<Equipment>, StorageError> {
        let filter = filter.clone();

        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT name, equipment_type, line, note FROM equipment WHERE 1 = 1");
            let mut params: Vec<String> = Vec::new();

            if !filter.types.is_empty() {
                let placeholders = vec!["?"; filter.types.len()].join(", ");
                sql.push_str(&format!(" AND equipment_type IN ({})", placeholders));
                params.extend(filter.types.iter().cloned());
            }
            if let Some(line) = filter.line.filter(|l| !l.is_empty()) {
                sql.push_str(" AND line = ?");
                params.push(line);
            }
            sql.push_str(" ORDER BY equipment_type, name");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(duckdb::params_from_iter(params.iter()), equipment_from_row)?;

            let mut equipment = Vec::new();
            for row in rows {
                equipment.push(row?);
            }
            Ok(equipment)
        })
        .await
    }

    async fn equipment_types(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            query_strings(conn, "SELECT DISTINCT equipment_type FROM equipment ORDER BY equipment_type")
        })
        .await
    }

    async fn equipment_lines(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| query_strings(conn, "SELECT DISTINCT line FROM equipment ORDER BY line"))
            .await
    }

    async fn insert_equipment(&self, equipment: &Equipment) -> Result<(), StorageError> {
        let equipment = equipment.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO equipment (name, equipment_type, line, note) VALUES (?, ?, ?, ?)",
                duckdb::params![
                    equipment.name,
                    equipment.equipment_type,
                    equipment.line,
                    equipment.note,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_equipment_note(&self, name: &str, note: Option<&str>) -> Result<bool, StorageError> {
        let name = name.to_string();
        let note = note.map(str::to_string);

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE equipment SET note = ? WHERE name = ?",
                duckdb::params![note, name],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn insert_lot(&self, lot: &Lot) -> Result<(), StorageError> {
        let lot = lot.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO lots (lot_id, carrier_id, qty, priority, technology, target_equipment_id, target_recipe_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    lot.lot_id,
                    lot.carrier_id,
                    lot.qty,
                    lot.priority,
                    lot.technology,
                    lot.target_equipment_id,
                    lot.target_recipe_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_lot(&self, lot_id: &str) -> Result<Option<Lot>, StorageError> {
        let lot_id = lot_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT lot_id, carrier_id, qty, priority, technology, target_equipment_id, target_recipe_id
                 FROM lots WHERE lot_id = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![lot_id])?;

            if let Some(row) = rows.next()? {
                Ok(Some(Lot {
                    lot_id: row.get(0)?,
                    carrier_id: row.get(1)?,
                    qty: row.get(2)?,
                    priority: row.get(3)?,
                    technology: row.get(4)?,
                    target_equipment_id: row.get(5)?,
                    target_recipe_id: row.get(6)?,
                }))
            } else {
                Ok(None)
            }
        })
        .await
    }

    async fn insert_event(&self, event: &ActualEvent) -> Result<i64, StorageError> {
        let event = event.clone();

        self.with_conn(move |conn| {
            let id = conn.query_row(
                "INSERT INTO actual_events (equipment_id, lot_id, lot_type, track_in_time, carrier_id, qty,
                                            recipe_id, next_equipment_id, location, end_time)
                 VALUES (?, ?, ?, make_timestamp(?), ?, ?, ?, ?, ?, make_timestamp(?))
                 RETURNING id",
                duckdb::params![
                    event.equipment_id,
                    event.lot_id,
                    event.lot_type,
                    event.track_in_time.timestamp_micros(),
                    event.carrier_id,
                    event.qty,
                    event.recipe_id,
                    event.next_equipment_id,
                    event.location,
                    event.end_time.map(|t| t.timestamp_micros()),
                ],
                |row| row.get::<_, i64>(0),
            )?;
            Ok(id)
        })
        .await
    }

    async fn events_for_equipment(&self, equipment_id: &str) -> Result<Vec<ActualEvent>, StorageError> {
        let equipment_id = equipment_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM actual_events WHERE equipment_id = ? ORDER BY track_in_time, id",
                EVENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(duckdb::params![equipment_id], event_from_row)?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
        .await
    }

    async fn pending_steps_for_lot(
        &self,
        lot_id: &str,
        equipment_id: &str,
    ) -> Result<Vec<StepRecord>, StorageError> {
        let lot_id = lot_id.to_string();
        let equipment_id = equipment_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM step_records
                 WHERE lot_id = ? AND equipment_id = ? AND processed = FALSE
                 ORDER BY step, created_at, id",
                STEP_COLUMNS
            );
            query_steps(conn, &sql, &[&lot_id, &equipment_id])
        })
        .await
    }

    async fn mark_step_processed(
        &self,
        step: &StepRecord,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let step = step.clone();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE step_records
                 SET processed = TRUE, processed_at = make_timestamp(?)
                 WHERE id = ? AND processed = FALSE
                   AND NOT EXISTS (
                       SELECT 1 FROM step_records
                       WHERE batch_id = ? AND lot_id = ? AND step < ? AND processed = FALSE
                   )",
                duckdb::params![
                    processed_at.timestamp_micros(),
                    step.id,
                    step.batch_id,
                    step.lot_id,
                    step.step,
                ],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn step_exists(&self, batch_id: &str, lot_id: &str, step: i32) -> Result<bool, StorageError> {
        let batch_id = batch_id.to_string();
        let lot_id = lot_id.to_string();

        self.with_conn(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM step_records WHERE batch_id = ? AND lot_id = ? AND step = ?",
                duckdb::params![batch_id, lot_id, step],
                |row| row.get::<_, i64>(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn completed_lots(&self, equipment_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        let equipment_id = equipment_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM step_records s
                 WHERE s.equipment_id = ? AND s.processed = TRUE
                   AND s.step = (
                       SELECT MAX(m.step) FROM step_records m
                       WHERE m.batch_id = s.batch_id AND m.lot_id = s.lot_id
                   )
                   AND NOT EXISTS (
                       SELECT 1 FROM step_records p
                       WHERE p.batch_id = s.batch_id AND p.lot_id = s.lot_id AND p.processed = FALSE
                   )
                 ORDER BY s.batch_id, s.lot_id",
                STEP_COLUMNS
            );
            query_steps(conn, &sql, &[&equipment_id])
        })
        .await
    }

    async fn step_processed_at(
        &self,
        equipment_id: &str,
        lot_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StepRecord>, StorageError> {
        let equipment_id = equipment_id.to_string();
        let lot_id = lot_id.to_string();
        let at_micros = at.timestamp_micros();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM step_records
                 WHERE equipment_id = ? AND lot_id = ? AND processed_at = make_timestamp(?)
                 ORDER BY id
                 LIMIT 1",
                STEP_COLUMNS
            );
            let steps = query_steps(conn, &sql, &[&equipment_id, &lot_id, &at_micros])?;
            Ok(steps.into_iter().next())
        })
        .await
    }

    async fn reserved_batches(
        &self,
        equipment_id: &str,
        limit: usize,
    ) -> Result<Vec<ReservedBatch>, StorageError> {
        let equipment_id = equipment_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id, epoch_us(MIN(created_at))
                 FROM step_records
                 WHERE equipment_id = ? AND processed = FALSE
                 GROUP BY batch_id
                 ORDER BY MIN(created_at), batch_id
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(duckdb::params![equipment_id, limit as i64], |row| {
                Ok(ReservedBatch {
                    batch_id: row.get(0)?,
                    created_at: micros_to_datetime(1, row.get(1)?)?,
                })
            })?;

            let mut batches = Vec::new();
            for row in rows {
                batches.push(row?);
            }
            Ok(batches)
        })
        .await
    }

    async fn batch_steps_on_equipment(
        &self,
        batch_id: &str,
        equipment_id: &str,
    ) -> Result<Vec<StepRecord>, StorageError> {
        let batch_id = batch_id.to_string();
        let equipment_id = equipment_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM step_records
                 WHERE batch_id = ? AND equipment_id = ?
                 ORDER BY lot_id, step",
                STEP_COLUMNS
            );
            query_steps(conn, &sql, &[&batch_id, &equipment_id])
        })
        .await
    }

    async fn steps_for_batch(&self, batch_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        let batch_id = batch_id.to_string();

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM step_records WHERE batch_id = ? ORDER BY lot_id, step",
                STEP_COLUMNS
            );
            query_steps(conn, &sql, &[&batch_id])
        })
        .await
    }

    async fn batch_members(&self, batch_id: &str) -> Result<Vec<BatchMember>, StorageError> {
        let batch_id = batch_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id, lot_id, carrier_id, qty, technology
                 FROM batch_members WHERE batch_id = ? ORDER BY lot_id",
            )?;
            let rows = stmt.query_map(duckdb::params![batch_id], |row| {
                Ok(BatchMember {
                    batch_id: row.get(0)?,
                    lot_id: row.get(1)?,
                    carrier_id: row.get(2)?,
                    qty: row.get(3)?,
                    technology: row.get(4)?,
                })
            })?;

            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            Ok(members)
        })
        .await
    }

    async fn create_batch(&self, plan: &BatchPlan) -> Result<(), StorageError> {
        let plan = plan.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let created_at = plan.created_at.timestamp_micros();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO step_records (batch_id, lot_id, carrier_id, step, equipment_id, recipe_id,
                                               next_equipment_id, qty, technology, processed, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE, make_timestamp(?))",
                )?;
                for step in &plan.steps {
                    stmt.execute(duckdb::params![
                        plan.batch_id,
                        step.lot_id,
                        step.carrier_id,
                        step.step,
                        step.equipment_id,
                        step.recipe_id,
                        step.next_equipment_id,
                        step.qty,
                        step.technology,
                        created_at,
                    ])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT INTO batch_members (batch_id, lot_id, carrier_id, qty, technology)
                     VALUES (?, ?, ?, ?, ?)",
                )?;
                for member in &plan.members {
                    stmt.execute(duckdb::params![
                        member.batch_id,
                        member.lot_id,
                        member.carrier_id,
                        member.qty,
                        member.technology,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_lot_from_batch(&self, batch_id: &str, lot_id: &str) -> Result<DeletedRows, StorageError> {
        let batch_id = batch_id.to_string();
        let lot_id = lot_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let steps = tx.execute(
                "DELETE FROM step_records WHERE batch_id = ? AND lot_id = ?",
                duckdb::params![batch_id, lot_id],
            )?;
            let members = tx.execute(
                "DELETE FROM batch_members WHERE batch_id = ? AND lot_id = ?",
                duckdb::params![batch_id, lot_id],
            )?;
            tx.commit()?;
            Ok(DeletedRows { steps, members })
        })
        .await
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedRows, StorageError> {
        let batch_id = batch_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let steps = tx.execute(
                "DELETE FROM step_records WHERE batch_id = ?",
                duckdb::params![batch_id],
            )?;
            let members = tx.execute(
                "DELETE FROM batch_members WHERE batch_id = ?",
                duckdb::params![batch_id],
            )?;
            tx.commit()?;
            Ok(DeletedRows { steps, members })
        })
        .await
    }
}
