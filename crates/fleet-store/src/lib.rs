use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

use fleet_core::{ControlError, Task, TaskState};

pub const TASK_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Durable record of every issued command. The connection mutex doubles as the
/// per-taskId serialization point: every mutation loads the row, runs the
/// state-machine transition and persists it without releasing the lock, so a
/// racing cancel and dispatch on the same task cannot interleave.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > TASK_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: TASK_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_tasks.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn create(
        &self,
        agent_identity: &str,
        command: &str,
        params: serde_json::Value,
        original_command: Option<String>,
        platform: Option<String>,
    ) -> Result<Task, StoreError> {
        let task = Task::new(agent_identity, command, params, original_command, platform);
        let conn = self.conn.lock().unwrap();
        Self::insert(&conn, &task)?;
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_task(&conn, task_id)
    }

    pub fn list(
        &self,
        agent_identity: Option<&str>,
        state: Option<TaskState>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT task_id, agent_identity, command, params_json, original_command, platform,
                    state, attempts, reason, last_attempt_at, created_at, sent_at, completed_at,
                    output, error_message, execution_time_ms
             FROM tasks",
        );
        let mut clauses = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(agent) = agent_identity {
            clauses.push("agent_identity = ?");
            binds.push(agent.to_string());
        }
        if let Some(state) = state {
            clauses.push("state = ?");
            binds.push(state.as_str().to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), Self::map_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn mark_sent(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.mark_sent(now))
    }

    pub fn mark_queued(&self, task_id: &str, reason: &str) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.mark_queued(reason))
    }

    pub fn complete(
        &self,
        task_id: &str,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.complete(output, now))
    }

    pub fn fail(
        &self,
        task_id: &str,
        error_message: &str,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.fail(error_message, output, now))
    }

    pub fn expire_sent(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.expire(now))
    }

    pub fn cancel(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.cancel(now))
    }

    pub fn retry(&self, task_id: &str) -> Result<Task, StoreError> {
        self.with_task(task_id, |task| task.retry())
    }

    /// Tasks stuck in `sent` whose last attempt predates the cutoff. Consumed
    /// by the optional watchdog sweep.
    pub fn stale_sent_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, agent_identity, command, params_json, original_command, platform,
                    state, attempts, reason, last_attempt_at, created_at, sent_at, completed_at,
                    output, error_message, execution_time_ms
             FROM tasks
             WHERE state = 'sent' AND sent_at IS NOT NULL AND sent_at < ?1",
        )?;
        let rows = stmt.query_map([cutoff.to_rfc3339()], Self::map_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    fn with_task<F>(&self, task_id: &str, apply: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), ControlError>,
    {
        let conn = self.conn.lock().unwrap();
        let mut task = Self::query_task(&conn, task_id)?;
        apply(&mut task)?;
        Self::persist(&conn, &task)?;
        Ok(task)
    }

    fn insert(conn: &Connection, task: &Task) -> Result<(), StoreError> {
        let params_json = serde_json::to_string(&task.params)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        conn.execute(
            "INSERT INTO tasks (
                task_id, agent_identity, command, params_json, original_command, platform,
                state, attempts, reason, last_attempt_at, created_at, sent_at, completed_at,
                output, error_message, execution_time_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                task.task_id,
                task.agent_identity,
                task.command,
                params_json,
                task.original_command,
                task.platform,
                task.queue.state.as_str(),
                task.queue.attempts,
                task.queue.reason,
                task.queue.last_attempt_at.map(|ts| ts.to_rfc3339()),
                task.created_at.to_rfc3339(),
                task.sent_at.map(|ts| ts.to_rfc3339()),
                task.completed_at.map(|ts| ts.to_rfc3339()),
                task.output,
                task.error_message,
                task.execution_time_ms,
            ],
        )?;
        Ok(())
    }

    fn persist(conn: &Connection, task: &Task) -> Result<(), StoreError> {
        let params_json = serde_json::to_string(&task.params)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let changed = conn.execute(
            "UPDATE tasks SET
                agent_identity = ?2, command = ?3, params_json = ?4, original_command = ?5,
                platform = ?6, state = ?7, attempts = ?8, reason = ?9, last_attempt_at = ?10,
                created_at = ?11, sent_at = ?12, completed_at = ?13, output = ?14,
                error_message = ?15, execution_time_ms = ?16
             WHERE task_id = ?1",
            params![
                task.task_id,
                task.agent_identity,
                task.command,
                params_json,
                task.original_command,
                task.platform,
                task.queue.state.as_str(),
                task.queue.attempts,
                task.queue.reason,
                task.queue.last_attempt_at.map(|ts| ts.to_rfc3339()),
                task.created_at.to_rfc3339(),
                task.sent_at.map(|ts| ts.to_rfc3339()),
                task.completed_at.map(|ts| ts.to_rfc3339()),
                task.output,
                task.error_message,
                task.execution_time_ms,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(task.task_id.clone()));
        }
        Ok(())
    }

    fn query_task(conn: &Connection, task_id: &str) -> Result<Task, StoreError> {
        let task = conn
            .query_row(
                "SELECT task_id, agent_identity, command, params_json, original_command, platform,
                        state, attempts, reason, last_attempt_at, created_at, sent_at, completed_at,
                        output, error_message, execution_time_ms
                 FROM tasks WHERE task_id = ?1",
                [task_id],
                Self::map_row,
            )
            .optional()?;
        task.ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Task> {
        let params_json: String = row.get(3)?;
        let params = serde_json::from_str(&params_json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
        })?;
        let state: String = row.get(6)?;
        let state = TaskState::from_str(&state).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                err.into(),
            )
        })?;

        Ok(Task {
            task_id: row.get(0)?,
            agent_identity: row.get(1)?,
            command: row.get(2)?,
            params,
            original_command: row.get(4)?,
            platform: row.get(5)?,
            queue: fleet_core::QueueInfo {
                state,
                attempts: row.get(7)?,
                reason: row.get(8)?,
                last_attempt_at: parse_opt_ts(row, 9)?,
            },
            created_at: parse_ts(row, 10)?,
            sent_at: parse_opt_ts(row, 11)?,
            completed_at: parse_opt_ts(row, 12)?,
            output: row.get(13)?,
            error_message: row.get(14)?,
            execution_time_ms: row.get(15)?,
        })
    }
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => {
            let ts = DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        idx,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
            Ok(Some(ts))
        }
        None => Ok(None),
    }
}
