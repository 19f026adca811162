use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;
pub type StateId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Pending,
    Completed,
    Incomplete,
    Failed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Pending => "pending",
            FinalStatus::Completed => "completed",
            FinalStatus::Incomplete => "incomplete",
            FinalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FinalStatus::Pending)
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FinalStatus::Pending),
            "completed" => Ok(FinalStatus::Completed),
            "incomplete" => Ok(FinalStatus::Incomplete),
            "failed" => Ok(FinalStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRecord {
    pub command: String,
    pub output: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_changes: Option<Vec<Change>>,
}

impl CommandRecord {
    pub fn new(command: impl Into<String>, output: impl Into<String>, success: bool) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            success,
            timestamp: Utc::now(),
            filesystem_changes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "task_description")]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_completed: bool,
    pub commands: Vec<CommandRecord>,
    pub final_status: FinalStatus,
    pub final_output: Option<String>,
    pub execution_time_seconds: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    Snapshot,
    Initial,
    BeforeCommand,
    AfterCommand,
    Final,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Snapshot => "snapshot",
            StateType::Initial => "initial",
            StateType::BeforeCommand => "before_command",
            StateType::AfterCommand => "after_command",
            StateType::Final => "final",
        }
    }
}

impl FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(StateType::Snapshot),
            "initial" => Ok(StateType::Initial),
            "before_command" => Ok(StateType::BeforeCommand),
            "after_command" => Ok(StateType::AfterCommand),
            "final" => Ok(StateType::Final),
            other => Err(format!("unknown state type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Dir,
}

/// Metadata captured for one path in a snapshot. `hash` is only set for files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMeta {
    #[serde(rename = "type")]
    pub kind: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub last_modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Relative path -> metadata. Keys are unique, so walk order is irrelevant.
pub type Snapshot = BTreeMap<String, EntryMeta>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub change_type: ChangeType,
    pub file_type: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesystemState {
    pub id: StateId,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub state_type: StateType,
    pub filesystem_data: Snapshot,
    pub command_index: Option<usize>,
    pub command_text: Option<String>,
    pub changes: Vec<Change>,
}

/// A state that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewFilesystemState {
    pub task_id: Option<TaskId>,
    pub state_type: StateType,
    pub filesystem_data: Snapshot,
    pub command_index: Option<usize>,
    pub command_text: Option<String>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task: Task,
    pub filesystem_states: Vec<FilesystemState>,
}
