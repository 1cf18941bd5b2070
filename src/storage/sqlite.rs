//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Times are stored as
//! RFC 3339 text; worlds and attempts as JSON.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use super::{OutcomeRecord, Storage, StorageError, StoredRun};
use crate::core::interval::Interval;
use crate::core::types::{ResourceName, RunId, TaskName};
use crate::core::world::World;
use crate::ledger::{DownRecord, LedgerEntry};
use crate::run::{RunHeader, TaskAttempt, TaskEntry, TaskState};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(other)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(other)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(other)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(other)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn other(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn time_to_string(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::SerializationError(format!("bad timestamp '{}': {}", s, e)))
}

fn string_to_run_id(s: &str) -> Result<RunId, StorageError> {
    RunId::parse(s).map_err(|e| StorageError::SerializationError(format!("bad run id '{}': {}", s, e)))
}

fn string_to_state(s: &str) -> Result<TaskState, StorageError> {
    TaskState::from_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

type IntervalRow = (String, String, String, String, String);

fn interval_parts(row: IntervalRow) -> Result<(ResourceName, TaskName, Interval, DateTime<Utc>), StorageError> {
    let (resource, producer, start, end, recorded_at) = row;
    Ok((
        ResourceName::new(resource),
        TaskName::new(producer),
        Interval::new(string_to_time(&start)?, string_to_time(&end)?),
        string_to_time(&recorded_at)?,
    ))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_run(&self, header: &RunHeader, world: &World) -> Result<(), StorageError> {
        let world_json = serde_json::to_string(world)?;
        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, tag, created_at, last_update, killed, world)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(header.run_id.to_string())
        .bind(&header.tag)
        .bind(time_to_string(header.created_at))
        .bind(time_to_string(header.last_update))
        .bind(header.killed)
        .bind(world_json)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("run: {}", header.run_id)))
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn update_run(&self, header: &RunHeader) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(other)?;
        write_header(&mut conn, header).await
    }

    async fn list_runs(&self) -> Result<Vec<RunHeader>, StorageError> {
        let rows: Vec<(String, String, String, String, bool)> = sqlx::query_as(
            "SELECT run_id, tag, created_at, last_update, killed FROM runs ORDER BY created_at, run_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.into_iter()
            .map(|row| {
                Ok(RunHeader {
                    run_id: string_to_run_id(&row.0)?,
                    tag: row.1,
                    created_at: string_to_time(&row.2)?,
                    last_update: string_to_time(&row.3)?,
                    killed: row.4,
                })
            })
            .collect()
    }

    async fn load_run(&self, run_id: &RunId) -> Result<StoredRun, StorageError> {
        let id = run_id.to_string();
        let row: (String, String, String, bool, String) = sqlx::query_as(
            "SELECT tag, created_at, last_update, killed, world FROM runs WHERE run_id = ?",
        )
        .bind(&id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?
        .ok_or_else(|| StorageError::NotFound(format!("run: {}", run_id)))?;

        let header = RunHeader {
            run_id: run_id.clone(),
            tag: row.0,
            created_at: string_to_time(&row.1)?,
            last_update: string_to_time(&row.2)?,
            killed: row.3,
        };
        let world: World = serde_json::from_str(&row.4)?;

        let entry_rows: Vec<(String, String, String, i64, bool, Option<String>)> = sqlx::query_as(
            r#"
            SELECT task, state, instant, generation, pending_down, started_at
            FROM task_entries WHERE run_id = ?
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        let mut entries = BTreeMap::new();
        for (task, state, instant, generation, pending_down, started_at) in entry_rows {
            entries.insert(
                TaskName::new(task),
                TaskEntry {
                    state: string_to_state(&state)?,
                    instant: string_to_time(&instant)?,
                    generation: generation.max(0) as u64,
                    pending_down,
                    started_at: started_at.as_deref().map(string_to_time).transpose()?,
                },
            );
        }

        let attempt_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT task, attempt FROM task_attempts WHERE run_id = ? ORDER BY id")
                .bind(&id)
                .fetch_all(&self.pool)
                .await
                .map_err(other)?;
        let attempts = attempt_rows
            .into_iter()
            .map(|(task, json)| Ok((TaskName::new(task), serde_json::from_str(&json)?)))
            .collect::<Result<Vec<(TaskName, TaskAttempt)>, StorageError>>()?;

        let interval_rows: Vec<IntervalRow> = sqlx::query_as(
            r#"
            SELECT resource, producer, start_time, end_time, recorded_at
            FROM ledger_intervals WHERE run_id = ? ORDER BY id
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;
        let intervals = interval_rows
            .into_iter()
            .map(|row| {
                let (resource, producer, interval, recorded_at) = interval_parts(row)?;
                Ok(LedgerEntry {
                    resource,
                    producer,
                    interval,
                    recorded_at,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let down_rows: Vec<IntervalRow> = sqlx::query_as(
            r#"
            SELECT resource, producer, start_time, end_time, recorded_at
            FROM down_records WHERE run_id = ? ORDER BY id
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;
        let downs = down_rows
            .into_iter()
            .map(|row| {
                let (resource, producer, interval, recorded_at) = interval_parts(row)?;
                Ok(DownRecord {
                    resource,
                    producer,
                    interval,
                    recorded_at,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(StoredRun {
            header,
            world,
            entries,
            attempts,
            intervals,
            downs,
        })
    }

    async fn save_task_entry(
        &self,
        run_id: &RunId,
        task: &TaskName,
        entry: &TaskEntry,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(other)?;
        write_entry(&mut conn, run_id, task, entry).await
    }

    async fn append_attempt(
        &self,
        run_id: &RunId,
        task: &TaskName,
        attempt: &TaskAttempt,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(other)?;
        write_attempt(&mut conn, run_id, task, attempt).await
    }

    async fn record_interval(
        &self,
        run_id: &RunId,
        entry: &LedgerEntry,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(other)?;
        write_interval(
            &mut conn,
            "ledger_intervals",
            run_id,
            &entry.resource,
            &entry.producer,
            entry.interval,
            entry.recorded_at,
        )
        .await
    }

    async fn record_down(&self, run_id: &RunId, down: &DownRecord) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(other)?;
        write_interval(
            &mut conn,
            "down_records",
            run_id,
            &down.resource,
            &down.producer,
            down.interval,
            down.recorded_at,
        )
        .await
    }

    async fn record_outcome(&self, outcome: &OutcomeRecord<'_>) -> Result<(), StorageError> {
        let run_id = &outcome.header.run_id;
        let mut tx = self.pool.begin().await.map_err(other)?;

        // The header goes first so an unknown run fails before anything is written
        write_header(&mut tx, outcome.header).await?;
        write_entry(&mut tx, run_id, outcome.task, outcome.entry).await?;
        write_attempt(&mut tx, run_id, outcome.task, outcome.attempt).await?;
        for entry in outcome.intervals {
            write_interval(
                &mut tx,
                "ledger_intervals",
                run_id,
                &entry.resource,
                &entry.producer,
                entry.interval,
                entry.recorded_at,
            )
            .await?;
        }
        for down in outcome.downs {
            write_interval(
                &mut tx,
                "down_records",
                run_id,
                &down.resource,
                &down.producer,
                down.interval,
                down.recorded_at,
            )
            .await?;
        }

        tx.commit().await.map_err(other)
    }
}

async fn write_header(conn: &mut SqliteConnection, header: &RunHeader) -> Result<(), StorageError> {
    let result = sqlx::query("UPDATE runs SET tag = ?, last_update = ?, killed = ? WHERE run_id = ?")
        .bind(&header.tag)
        .bind(time_to_string(header.last_update))
        .bind(header.killed)
        .bind(header.run_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(other)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound(format!("run: {}", header.run_id)));
    }
    Ok(())
}

async fn write_entry(
    conn: &mut SqliteConnection,
    run_id: &RunId,
    task: &TaskName,
    entry: &TaskEntry,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO task_entries (run_id, task, state, instant, generation, pending_down, started_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (run_id, task) DO UPDATE SET
            state = excluded.state,
            instant = excluded.instant,
            generation = excluded.generation,
            pending_down = excluded.pending_down,
            started_at = excluded.started_at
        "#,
    )
    .bind(run_id.to_string())
    .bind(task.as_str())
    .bind(entry.state.as_str())
    .bind(time_to_string(entry.instant))
    .bind(entry.generation as i64)
    .bind(entry.pending_down)
    .bind(entry.started_at.map(time_to_string))
    .execute(&mut *conn)
    .await
    .map_err(other)?;
    Ok(())
}

async fn write_attempt(
    conn: &mut SqliteConnection,
    run_id: &RunId,
    task: &TaskName,
    attempt: &TaskAttempt,
) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO task_attempts (run_id, task, attempt) VALUES (?, ?, ?)")
        .bind(run_id.to_string())
        .bind(task.as_str())
        .bind(serde_json::to_string(attempt)?)
        .execute(&mut *conn)
        .await
        .map_err(other)?;
    Ok(())
}

/// Append to `ledger_intervals` or `down_records`, which share a layout.
async fn write_interval(
    conn: &mut SqliteConnection,
    table: &'static str,
    run_id: &RunId,
    resource: &ResourceName,
    producer: &TaskName,
    interval: Interval,
    recorded_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    let sql = format!(
        "INSERT INTO {} (run_id, resource, producer, start_time, end_time, recorded_at) VALUES (?, ?, ?, ?, ?, ?)",
        table
    );
    sqlx::query(&sql)
        .bind(run_id.to_string())
        .bind(resource.as_str())
        .bind(producer.as_str())
        .bind(time_to_string(interval.start))
        .bind(time_to_string(interval.end))
        .bind(time_to_string(recorded_at))
        .execute(&mut *conn)
        .await
        .map_err(other)?;
    Ok(())
}
