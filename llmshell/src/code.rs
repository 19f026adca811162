use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::executor::{CommandResult, ProcessRunner, SystemRunner};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileWriteResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Writes and runs generated code, confined to one working root.
#[derive(Clone)]
pub struct CodeRunner {
    root: PathBuf,
    interpreter: String,
    timeout: Duration,
    runner: Arc<dyn ProcessRunner>,
}

impl CodeRunner {
    pub fn new(root: impl Into<PathBuf>, interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            interpreter: interpreter.into(),
            timeout,
            runner: Arc::new(SystemRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Resolves `path` against the root. `None` when it would land outside.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined)?;
        let root = normalize(&self.root)?;
        (normalized.starts_with(&root) && normalized != root).then_some(normalized)
    }

    pub fn write_code_file(&self, path: &str, content: &str) -> FileWriteResult {
        let Some(full_path) = self.resolve(path) else {
            warn!("Refusing to write {} outside {}", path, self.root.display());
            return FileWriteResult {
                success: false,
                message: format!(
                    "For security reasons, cannot create files outside of {}",
                    self.root.display()
                ),
                path: None,
            };
        };

        let written = full_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&full_path, content));
        match written {
            Ok(()) => {
                info!("Wrote {} ({} bytes)", full_path.display(), content.len());
                FileWriteResult {
                    success: true,
                    message: format!("Created Python file at {path}"),
                    path: Some(path.to_string()),
                }
            }
            Err(err) => FileWriteResult {
                success: false,
                message: format!("Failed to create Python file: {err}"),
                path: None,
            },
        }
    }

    /// Runs `code` with the interpreter, either from a temporary file inside
    /// the root or inline via `-c`.
    pub fn run_code(&self, code: &str, use_file: bool) -> CommandResult {
        if !use_file {
            let mut cmd = Command::new(&self.interpreter);
            cmd.arg("-c").arg(code).current_dir(&self.root);
            return self.run(cmd, format!("{} -c <code>", self.interpreter));
        }

        let tmp = tempfile::Builder::new()
            .suffix(".py")
            .tempfile_in(&self.root)
            .and_then(|mut tmp| {
                tmp.write_all(code.as_bytes())?;
                tmp.flush()?;
                Ok(tmp)
            });
        let tmp = match tmp {
            Ok(tmp) => tmp,
            Err(err) => {
                return CommandResult::failure(
                    self.interpreter.clone(),
                    format!("Error executing Python code: {err}"),
                );
            }
        };

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(tmp.path()).current_dir(&self.root);
        let label = format!("{} {}", self.interpreter, tmp.path().display());
        self.run(cmd, label)
        // tmp is removed on drop
    }

    pub fn run_code_file(&self, path: &str, args: &[String]) -> CommandResult {
        let Some(full_path) = self.resolve(path) else {
            return CommandResult::failure(
                path,
                format!(
                    "For security reasons, cannot execute files outside of {}",
                    self.root.display()
                ),
            );
        };
        if !full_path.is_file() {
            return CommandResult::failure(path, format!("Python file not found: {path}"));
        }
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&full_path).args(args).current_dir(&self.root);
        self.run(cmd, format!("{} {}", self.interpreter, path))
    }

    fn run(&self, cmd: Command, label: String) -> CommandResult {
        debug!("Running code: {}", label);
        match self.runner.run(cmd, self.timeout) {
            Ok(out) if out.timed_out => CommandResult::failure(
                label,
                format!("Execution timed out after {} seconds.", self.timeout.as_secs()),
            ),
            Ok(out) => CommandResult {
                success: out.return_code == Some(0),
                output: out.combined(),
                command: label,
                return_code: out.return_code,
            },
            Err(err) => CommandResult::failure(label, format!("Error executing Python code: {err:#}")),
        }
    }
}

/// Lexical normalization: folds `.` and `..` without touching the filesystem.
/// `None` if `..` climbs above the filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}
