use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::diff::diff;
use crate::error::ShellResult;
use crate::models::{Change, NewFilesystemState, StateId, StateType, TaskId};
use crate::snapshot::snapshot;
use crate::store::RecordStore;

/// Where a captured state belongs: an optional task and command.
#[derive(Debug, Clone, Default)]
pub struct StateContext<'a> {
    pub task_id: Option<TaskId>,
    pub command_index: Option<usize>,
    pub command_text: Option<&'a str>,
}

impl<'a> StateContext<'a> {
    pub fn task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn command(task_id: TaskId, index: usize, text: &'a str) -> Self {
        Self {
            task_id: Some(task_id),
            command_index: Some(index),
            command_text: Some(text),
        }
    }
}

/// Snapshots the workspace root and persists the result.
#[derive(Clone)]
pub struct FilesystemTracker {
    root: PathBuf,
    store: Arc<dyn RecordStore>,
}

impl FilesystemTracker {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capture(&self, state_type: StateType, ctx: StateContext<'_>) -> ShellResult<StateId> {
        let state = NewFilesystemState {
            task_id: ctx.task_id,
            state_type,
            filesystem_data: snapshot(&self.root),
            command_index: ctx.command_index,
            command_text: ctx.command_text.map(str::to_string),
            changes: Vec::new(),
        };
        self.store.save_filesystem_state(&state)
    }

    /// Snapshots now, diffs against `previous_state_id` and stores the new
    /// state together with the changes.
    pub fn compare_and_capture(
        &self,
        previous_state_id: StateId,
        state_type: StateType,
        ctx: StateContext<'_>,
    ) -> ShellResult<(StateId, Vec<Change>)> {
        let previous = self.store.get_filesystem_state(previous_state_id)?;
        let current = snapshot(&self.root);
        let changes = diff(&previous.filesystem_data, &current);
        debug!(
            "{} change(s) since state {}",
            changes.len(),
            previous_state_id
        );

        let state = NewFilesystemState {
            task_id: ctx.task_id,
            state_type,
            filesystem_data: current,
            command_index: ctx.command_index,
            command_text: ctx.command_text.map(str::to_string),
            changes: changes.clone(),
        };
        let id = self.store.save_filesystem_state(&state)?;
        Ok((id, changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeType;
    use crate::store::SqliteStore;
    use std::fs;

    #[test]
    fn captures_and_compares_against_stored_state() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), "v1").unwrap();
        fs::write(dir.path().join("drop.txt"), "bye").unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tracker = FilesystemTracker::new(dir.path(), store.clone());

        let before = tracker
            .capture(StateType::Snapshot, StateContext::default())
            .unwrap();

        fs::write(dir.path().join("keep.txt"), "v2").unwrap();
        fs::remove_file(dir.path().join("drop.txt")).unwrap();
        fs::write(dir.path().join("new.txt"), "hi").unwrap();

        let (after, changes) = tracker
            .compare_and_capture(before, StateType::Snapshot, StateContext::default())
            .unwrap();
        let kind = |path: &str| {
            changes
                .iter()
                .find(|c| c.path == path)
                .map(|c| c.change_type)
        };
        assert_eq!(kind("keep.txt"), Some(ChangeType::Modified));
        assert_eq!(kind("drop.txt"), Some(ChangeType::Deleted));
        assert_eq!(kind("new.txt"), Some(ChangeType::Created));

        let stored = store.get_filesystem_state(after).unwrap();
        assert_eq!(stored.changes, changes);
        assert!(store.get_filesystem_state(before).unwrap().changes.is_empty());
    }

    #[test]
    fn compare_with_unknown_state_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tracker = FilesystemTracker::new(dir.path(), store);
        let err = tracker
            .compare_and_capture(99, StateType::Snapshot, StateContext::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
