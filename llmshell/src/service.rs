use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::allowlist::Allowlist;
use crate::api::{CompletionBackend, LlmService, OllamaClient};
use crate::code::{CodeRunner, FileWriteResult};
use crate::config::AppConfig;
use crate::error::{ShellError, ShellResult};
use crate::executor::{CommandResult, Executor};
use crate::history::CommandHistory;
use crate::models::{Change, StateId, StateType, Task, TaskHistory, TaskId};
use crate::orchestrator::{Orchestrator, TaskOutcome};
use crate::store::{RecordStore, SqliteStore};
use crate::tracker::{FilesystemTracker, StateContext};

pub const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comparison {
    pub state_id: StateId,
    pub changes: Vec<Change>,
}

/// Everything a front end needs: run tasks, inspect their history, and
/// reach the executor and code runner directly.
pub struct Service {
    store: Arc<dyn RecordStore>,
    orchestrator: Orchestrator,
    executor: Executor,
    code: CodeRunner,
    tracker: FilesystemTracker,
}

impl Service {
    /// Wires the real backend, the SQLite store and the command history from
    /// configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path).with_context(|| {
            format!(
                "failed opening database {}",
                config.database_path.display()
            )
        })?;
        let backend = OllamaClient::new(config)?;
        let history = CommandHistory::open(config.history_path()).with_context(|| {
            format!(
                "failed opening command history {}",
                config.history_path().display()
            )
        })?;
        Ok(Self::assemble(
            config,
            Arc::new(store),
            Arc::new(backend),
            Some(history),
        ))
    }

    pub fn new(
        config: &AppConfig,
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self::assemble(config, store, backend, None)
    }

    fn assemble(
        config: &AppConfig,
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn CompletionBackend>,
        history: Option<CommandHistory>,
    ) -> Self {
        let root = config.workspace_root.clone();
        let mut executor = Executor::new(
            Allowlist::from_config(config.allowlist.clone()),
            config.shell.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
        .with_default_cwd(root.clone());
        if let Some(history) = history {
            executor = executor.with_history(history);
        }
        let code = CodeRunner::new(
            root.clone(),
            config.python.clone(),
            Duration::from_secs(config.code_timeout_seconds),
        );
        let tracker = FilesystemTracker::new(root, store.clone());
        let orchestrator = Orchestrator::new(
            store.clone(),
            LlmService::new(backend),
            executor.clone(),
            code.clone(),
            tracker.clone(),
        )
        .with_max_commands(config.max_commands);
        Self {
            store,
            orchestrator,
            executor,
            code,
            tracker,
        }
    }

    pub fn execute_task(&self, description: &str) -> ShellResult<TaskOutcome> {
        let description = description.trim();
        if description.is_empty() {
            return Err(ShellError::Validation(
                "task description must not be empty".into(),
            ));
        }
        self.orchestrator.execute_task(description)
    }

    pub fn get_recent_tasks(&self, limit: usize) -> ShellResult<Vec<Task>> {
        self.store.list_recent_tasks(limit)
    }

    pub fn get_task_history(&self, task_id: TaskId) -> ShellResult<TaskHistory> {
        let task = self.store.get_task(task_id)?;
        let filesystem_states = self.store.list_filesystem_states(task_id)?;
        Ok(TaskHistory {
            task,
            filesystem_states,
        })
    }

    /// Records a standalone `snapshot` state of the workspace.
    pub fn snapshot_filesystem(&self) -> ShellResult<StateId> {
        let id = self
            .tracker
            .capture(StateType::Snapshot, StateContext::default())?;
        info!("Captured workspace snapshot {}", id);
        Ok(id)
    }

    pub fn compare_filesystem(&self, previous_state_id: StateId) -> ShellResult<Comparison> {
        let (state_id, changes) = self.tracker.compare_and_capture(
            previous_state_id,
            StateType::Snapshot,
            StateContext::default(),
        )?;
        Ok(Comparison { state_id, changes })
    }

    /// Runs one command outside any task. Nothing is persisted.
    pub fn run_command(&self, command: &str) -> CommandResult {
        let result = self.executor.execute(command, None);
        if !result.success {
            warn!("Direct command '{}' failed", command);
        }
        result
    }

    pub fn run_code(&self, code: &str, use_file: bool) -> CommandResult {
        self.code.run_code(code, use_file)
    }

    pub fn write_code_file(&self, path: &str, content: &str) -> FileWriteResult {
        self.code.write_code_file(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;
    use crate::models::{ChangeType, FinalStatus};

    struct Always(&'static str);

    impl CompletionBackend for Always {
        fn complete(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn service(root: &std::path::Path, reply: &'static str) -> Service {
        let mut config = AppConfig::with_root(root);
        config.python = "sh".into();
        config.max_commands = 2;
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        Service::new(&config, store, Arc::new(Always(reply)))
    }

    #[test]
    fn rejects_blank_task() {
        let dir = tempfile::tempdir().unwrap();
        let err = service(dir.path(), "TASK_COMPLETE")
            .execute_task("   ")
            .unwrap_err();
        assert!(matches!(err, ShellError::Validation(_)));
    }

    #[test]
    fn task_history_lists_states_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), "pwd");
        let outcome = svc.execute_task("where am i").unwrap();
        assert_eq!(outcome.commands_executed, 2);

        let history = svc.get_task_history(outcome.task_id).unwrap();
        assert_eq!(history.task.final_status, FinalStatus::Incomplete);
        let kinds: Vec<_> = history
            .filesystem_states
            .iter()
            .map(|s| s.state_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                StateType::Initial,
                StateType::BeforeCommand,
                StateType::AfterCommand,
                StateType::BeforeCommand,
                StateType::AfterCommand,
                StateType::Final,
            ]
        );
        // commands run inside the workspace root
        let root_name = dir.path().file_name().unwrap().to_string_lossy();
        assert!(history.task.commands[0].output.contains(&*root_name));

        let recent = svc.get_recent_tasks(DEFAULT_RECENT_LIMIT).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, outcome.task_id);
    }

    #[test]
    fn unknown_task_history_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = service(dir.path(), "TASK_COMPLETE")
            .get_task_history(404)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn snapshot_then_compare_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), "TASK_COMPLETE");
        let first = svc.snapshot_filesystem().unwrap();

        let written = svc.write_code_file("tool.py", "print('x')");
        assert!(written.success);

        let comparison = svc.compare_filesystem(first).unwrap();
        assert_ne!(comparison.state_id, first);
        assert_eq!(comparison.changes.len(), 1);
        assert_eq!(comparison.changes[0].path, "tool.py");
        assert_eq!(comparison.changes[0].change_type, ChangeType::Created);

        let again = svc.compare_filesystem(comparison.state_id).unwrap();
        assert!(again.changes.is_empty());
    }

    #[test]
    fn direct_command_and_code_bypass_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), "TASK_COMPLETE");

        let ok = svc.run_command("echo direct");
        assert!(ok.success);
        assert!(ok.output.contains("direct"));

        let denied = svc.run_command("shutdown now");
        assert!(!denied.success);
        assert_eq!(denied.output, "Command 'shutdown' is not allowed.");

        let code = svc.run_code("echo coded", false);
        assert!(code.success);
        assert!(code.output.contains("coded"));

        assert!(svc.get_recent_tasks(5).unwrap().is_empty());
    }
}
