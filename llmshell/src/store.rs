use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, trace};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{ShellError, ShellResult};
use crate::models::{
    Change, CommandRecord, FilesystemState, FinalStatus, NewFilesystemState, StateId, Task, TaskId,
};

pub const SCHEMA_VERSION: i64 = 1;

/// Persistence for tasks and their filesystem history.
///
/// Implementations must serialize mutation of a single task's command list.
pub trait RecordStore: Send + Sync {
    fn create_task(&self, description: &str) -> ShellResult<Task>;
    /// Appends a record and returns its index in the task's command list.
    fn append_command(&self, task_id: TaskId, record: &CommandRecord) -> ShellResult<usize>;
    fn set_command_changes(
        &self,
        task_id: TaskId,
        index: usize,
        changes: &[Change],
    ) -> ShellResult<()>;
    fn complete_task(
        &self,
        task_id: TaskId,
        status: FinalStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> ShellResult<Task>;
    fn get_task(&self, task_id: TaskId) -> ShellResult<Task>;
    fn list_recent_tasks(&self, limit: usize) -> ShellResult<Vec<Task>>;
    /// Removes a task together with all of its filesystem states.
    fn delete_task(&self, task_id: TaskId) -> ShellResult<()>;
    fn save_filesystem_state(&self, state: &NewFilesystemState) -> ShellResult<StateId>;
    fn get_filesystem_state(&self, state_id: StateId) -> ShellResult<FilesystemState>;
    fn list_filesystem_states(&self, task_id: TaskId) -> ShellResult<Vec<FilesystemState>>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> ShellResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening record store at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> ShellResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ShellResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // statement behind, so a poisoned guard is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> ShellResult<i64> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> ShellResult<()> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(ShellError::Validation(format!(
                "unsupported schema version {current}, max supported {SCHEMA_VERSION}"
            )));
        }
        if current < 1 {
            debug!("Applying schema migration 1");
            let conn = self.conn();
            conn.execute_batch(include_str!("../migrations/0001_initial.sql"))?;
            conn.execute("PRAGMA user_version = 1", [])?;
        }
        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, task_description, created_at, completed_at, is_completed, \
     commands_json, final_status, final_output, execution_time_seconds, error_message";

const STATE_COLUMNS: &str = "id, task_id, timestamp, state_type, filesystem_data_json, \
     command_index, command_text, changes_json";

struct TaskRow {
    id: i64,
    description: String,
    created_at: String,
    completed_at: Option<String>,
    is_completed: bool,
    commands_json: String,
    final_status: String,
    final_output: Option<String>,
    execution_time_seconds: Option<i64>,
    error_message: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            description: row.get(1)?,
            created_at: row.get(2)?,
            completed_at: row.get(3)?,
            is_completed: row.get(4)?,
            commands_json: row.get(5)?,
            final_status: row.get(6)?,
            final_output: row.get(7)?,
            execution_time_seconds: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    fn into_task(self) -> ShellResult<Task> {
        Ok(Task {
            id: self.id,
            description: self.description,
            created_at: parse_ts(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            is_completed: self.is_completed,
            commands: serde_json::from_str(&self.commands_json)?,
            final_status: self.final_status.parse().map_err(ShellError::Parse)?,
            final_output: self.final_output,
            execution_time_seconds: self.execution_time_seconds,
            error_message: self.error_message,
        })
    }
}

struct StateRow {
    id: i64,
    task_id: Option<i64>,
    timestamp: String,
    state_type: String,
    filesystem_data_json: String,
    command_index: Option<i64>,
    command_text: Option<String>,
    changes_json: String,
}

impl StateRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            timestamp: row.get(2)?,
            state_type: row.get(3)?,
            filesystem_data_json: row.get(4)?,
            command_index: row.get(5)?,
            command_text: row.get(6)?,
            changes_json: row.get(7)?,
        })
    }

    fn into_state(self) -> ShellResult<FilesystemState> {
        Ok(FilesystemState {
            id: self.id,
            task_id: self.task_id,
            timestamp: parse_ts(&self.timestamp)?,
            state_type: self.state_type.parse().map_err(ShellError::Parse)?,
            filesystem_data: serde_json::from_str(&self.filesystem_data_json)?,
            command_index: self.command_index.map(|idx| idx as usize),
            command_text: self.command_text,
            changes: serde_json::from_str(&self.changes_json)?,
        })
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> ShellResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| ShellError::Parse(format!("invalid timestamp '{raw}': {err}")))
}

fn load_task(conn: &Connection, task_id: TaskId) -> ShellResult<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, params![task_id], TaskRow::from_row)
        .optional()?
        .ok_or_else(|| ShellError::task_not_found(task_id))?
        .into_task()
}

impl RecordStore for SqliteStore {
    fn create_task(&self, description: &str) -> ShellResult<Task> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (task_description, created_at, commands_json, final_status)
             VALUES (?1, ?2, '[]', ?3)",
            params![
                description,
                format_ts(Utc::now()),
                FinalStatus::Pending.as_str()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created task {}", id);
        load_task(&conn, id)
    }

    fn append_command(&self, task_id: TaskId, record: &CommandRecord) -> ShellResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut task = load_task(&tx, task_id)?;
        if task.is_completed {
            return Err(ShellError::Validation(format!(
                "task {task_id} is already {}",
                task.final_status
            )));
        }
        let index = task.commands.len();
        task.commands.push(record.clone());
        tx.execute(
            "UPDATE tasks SET commands_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&task.commands)?, task_id],
        )?;
        tx.commit()?;
        trace!("Task {} command {} appended", task_id, index);
        Ok(index)
    }

    fn set_command_changes(
        &self,
        task_id: TaskId,
        index: usize,
        changes: &[Change],
    ) -> ShellResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut task = load_task(&tx, task_id)?;
        let Some(record) = task.commands.get_mut(index) else {
            return Err(ShellError::Validation(format!(
                "task {task_id} has no command at index {index}"
            )));
        };
        record.filesystem_changes = Some(changes.to_vec());
        tx.execute(
            "UPDATE tasks SET commands_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&task.commands)?, task_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn complete_task(
        &self,
        task_id: TaskId,
        status: FinalStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> ShellResult<Task> {
        if !status.is_terminal() {
            return Err(ShellError::Validation(format!(
                "cannot complete task {task_id} with status {status}"
            )));
        }
        let conn = self.conn();
        let task = load_task(&conn, task_id)?;
        if task.is_completed {
            return Err(ShellError::Validation(format!(
                "task {task_id} is already {}",
                task.final_status
            )));
        }
        let now = Utc::now();
        let elapsed = (now - task.created_at).num_seconds().max(0);
        conn.execute(
            "UPDATE tasks SET is_completed = 1, completed_at = ?1, final_status = ?2,
                 final_output = ?3, error_message = ?4, execution_time_seconds = ?5
             WHERE id = ?6",
            params![
                format_ts(now),
                status.as_str(),
                output,
                error,
                elapsed,
                task_id
            ],
        )?;
        info!("Task {} finished as {} after {}s", task_id, status, elapsed);
        load_task(&conn, task_id)
    }

    fn get_task(&self, task_id: TaskId) -> ShellResult<Task> {
        load_task(&self.conn(), task_id)
    }

    fn list_recent_tasks(&self, limit: usize) -> ShellResult<Vec<Task>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], TaskRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    fn delete_task(&self, task_id: TaskId) -> ShellResult<()> {
        let changed = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        if changed == 0 {
            return Err(ShellError::task_not_found(task_id));
        }
        Ok(())
    }

    fn save_filesystem_state(&self, state: &NewFilesystemState) -> ShellResult<StateId> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO filesystem_states (task_id, timestamp, state_type, filesystem_data_json,
                 command_index, command_text, changes_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                state.task_id,
                format_ts(Utc::now()),
                state.state_type.as_str(),
                serde_json::to_string(&state.filesystem_data)?,
                state.command_index.map(|idx| idx as i64),
                state.command_text,
                serde_json::to_string(&state.changes)?,
            ],
        )?;
        let id = conn.last_insert_rowid();
        trace!(
            "Saved {} state {} ({} entries, {} changes)",
            state.state_type.as_str(),
            id,
            state.filesystem_data.len(),
            state.changes.len()
        );
        Ok(id)
    }

    fn get_filesystem_state(&self, state_id: StateId) -> ShellResult<FilesystemState> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM filesystem_states WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![state_id], StateRow::from_row)
            .optional()?
            .ok_or_else(|| ShellError::state_not_found(state_id))?
            .into_state()
    }

    fn list_filesystem_states(&self, task_id: TaskId) -> ShellResult<Vec<FilesystemState>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM filesystem_states WHERE task_id = ?1
             ORDER BY timestamp, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![task_id], StateRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(StateRow::into_state).collect()
    }
}
