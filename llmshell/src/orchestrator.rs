//! The command loop: ask the model for a command, run it, snapshot the
//! workspace around it, record everything, repeat until the model says the
//! task is done or the command budget runs out.

use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::api::LlmService;
use crate::code::CodeRunner;
use crate::conversation::Conversation;
use crate::error::ShellResult;
use crate::executor::{CommandResult, Executor};
use crate::models::{CommandRecord, FinalStatus, StateType, Task, TaskId};
use crate::parser::{COMPLETION_SENTINEL, Reply, classify_reply};
use crate::store::RecordStore;
use crate::tracker::{FilesystemTracker, StateContext};

pub const DEFAULT_MAX_COMMANDS: usize = 10;

pub const SYSTEM_PROMPT: &str = "You are an AI assistant that helps execute shell commands based on the user's task. \
Provide only the necessary shell commands to accomplish the task. Output only one command at a time. \
After each command, evaluate if the task is complete based on the command output. \
If the task is complete, respond with exactly 'TASK_COMPLETE'. \
Consider all previously executed commands and their outputs when determining if additional commands are needed. \
Avoid repeating commands unless absolutely necessary. \
To have a Python file written for you, respond with 'PYTHON_FILE:<filename>:<description>'. \
To have Python code generated and run, respond with 'PYTHON_CODE:<description>'.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub commands_executed: usize,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one executed step, whether a shell command or a directive.
struct StepResult {
    success: bool,
    output: String,
}

impl From<CommandResult> for StepResult {
    fn from(result: CommandResult) -> Self {
        Self {
            success: result.success,
            output: result.output,
        }
    }
}

/// Mutable bookkeeping for one running task.
struct RunState {
    task_id: TaskId,
    description: String,
    conversation: Conversation,
    records: Vec<CommandRecord>,
    final_output: String,
    command_count: usize,
}

impl RunState {
    fn new(task: &Task) -> Self {
        let mut conversation = Conversation::new(SYSTEM_PROMPT);
        conversation.push_user(format!(
            "Task: {}\nPreviously executed commands: []",
            task.description
        ));
        Self {
            task_id: task.id,
            description: task.description.clone(),
            conversation,
            records: Vec::new(),
            final_output: String::new(),
            command_count: 0,
        }
    }

    fn command_list(&self) -> String {
        let commands: Vec<&str> = self.records.iter().map(|r| r.command.as_str()).collect();
        serde_json::to_string(&commands).unwrap_or_else(|_| "[]".into())
    }

    fn push_turn(&mut self, command: &str, output: &str, include_task: bool) {
        self.conversation.push_assistant(command);
        let mut user = format!("Command output: {output}\n");
        if include_task {
            user.push_str(&format!("Current task status: {}\n", self.description));
        }
        user.push_str(&format!(
            "Previously executed commands: {}\n\
             If the task is complete, respond with exactly '{COMPLETION_SENTINEL}'. \
             Otherwise, provide the next command needed.",
            self.command_list()
        ));
        self.conversation.push_user(user);
    }
}

enum LoopEnd {
    Completed,
    Exhausted,
    Failed(String),
}

pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    llm: LlmService,
    executor: Executor,
    code: CodeRunner,
    tracker: FilesystemTracker,
    max_commands: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        llm: LlmService,
        executor: Executor,
        code: CodeRunner,
        tracker: FilesystemTracker,
    ) -> Self {
        Self {
            store,
            llm,
            executor,
            code,
            tracker,
            max_commands: DEFAULT_MAX_COMMANDS,
        }
    }

    pub fn with_max_commands(mut self, max_commands: usize) -> Self {
        self.max_commands = max_commands;
        self
    }

    /// Persists a new task and records the workspace as its `initial` state.
    pub fn create_task(&self, description: &str) -> ShellResult<Task> {
        let task = self.store.create_task(description)?;
        if let Err(err) = self
            .tracker
            .capture(StateType::Initial, StateContext::task(task.id))
        {
            warn!("Initial snapshot for task {} failed: {}", task.id, err);
        }
        Ok(task)
    }

    /// Drives one task from description to a terminal status.
    ///
    /// Only record-store failures surface as `Err`; everything else ends up
    /// in the returned outcome and the stored task.
    pub fn execute_task(&self, description: &str) -> ShellResult<TaskOutcome> {
        let task = self.create_task(description)?;
        info!("Task {} started: {}", task.id, description);
        let mut run = RunState::new(&task);

        let end = match self.run_loop(&mut run) {
            Ok(end) => end,
            Err(err) => {
                error!("Task {} aborted: {}", run.task_id, err);
                let message = err.to_string();
                if let Err(complete_err) = self.finish(&run, FinalStatus::Failed, Some(&message)) {
                    error!(
                        "Could not mark task {} failed: {}",
                        run.task_id, complete_err
                    );
                }
                return Err(err);
            }
        };

        let (status, error) = match end {
            LoopEnd::Completed => (FinalStatus::Completed, None),
            LoopEnd::Exhausted => (FinalStatus::Incomplete, None),
            LoopEnd::Failed(message) => (FinalStatus::Failed, Some(message)),
        };
        self.finish(&run, status, error.as_deref())?;

        Ok(TaskOutcome {
            task_id: run.task_id,
            success: status == FinalStatus::Completed,
            commands_executed: run.command_count,
            output: run.final_output,
            error,
        })
    }

    fn run_loop(&self, run: &mut RunState) -> ShellResult<LoopEnd> {
        while run.command_count < self.max_commands {
            trace!(
                "Task {} iteration {}/{}",
                run.task_id,
                run.command_count + 1,
                self.max_commands
            );
            let reply = match self.llm.generate_next_command(&run.conversation) {
                Ok(reply) => reply,
                Err(err) => {
                    return Ok(LoopEnd::Failed(format!(
                        "Failed to get command from LLM: {err}"
                    )));
                }
            };

            match classify_reply(&reply) {
                Reply::Complete => {
                    info!("Task {} reported complete by model", run.task_id);
                    return Ok(LoopEnd::Completed);
                }
                Reply::WriteFile {
                    filename,
                    description,
                } => {
                    let step = self.record_step(run, &reply, || {
                        self.write_generated_file(&filename, &description)
                    })?;
                    run.command_count += 1;
                    run.push_turn(&reply, &step.output, false);
                }
                Reply::RunCode { description } => {
                    let step =
                        self.record_step(run, &reply, || self.run_generated_code(&description))?;
                    run.command_count += 1;
                    run.push_turn(&reply, &step.output, false);
                }
                Reply::Command(command) => {
                    let step = self.record_step(run, &command, || {
                        self.executor.execute(&command, Some(self.tracker.root())).into()
                    })?;
                    run.command_count += 1;
                    run.push_turn(&command, &step.output, true);

                    let prior = &run.records;
                    let judgment =
                        self.llm
                            .analyze_outcome(&run.description, &command, &step.output, prior);
                    if judgment.task_complete {
                        info!(
                            "Task {} judged complete: {}",
                            run.task_id, judgment.explanation
                        );
                        return Ok(LoopEnd::Completed);
                    }
                    debug!("Task {} not complete: {}", run.task_id, judgment.explanation);
                }
            }
        }

        info!(
            "Task {} stopped after {} command(s) without completing",
            run.task_id, run.command_count
        );
        Ok(LoopEnd::Exhausted)
    }

    /// Runs one step between a `before_command` and an `after_command`
    /// snapshot, appends its record and annotates it with the diff.
    fn record_step(
        &self,
        run: &mut RunState,
        command: &str,
        step: impl FnOnce() -> StepResult,
    ) -> ShellResult<StepResult> {
        let index = run.records.len();
        let before = self
            .tracker
            .capture(
                StateType::BeforeCommand,
                StateContext::command(run.task_id, index, command),
            )
            .map_err(|err| warn!("before_command snapshot failed: {}", err))
            .ok();

        let result = step();
        info!(
            "Task {} step {}: '{}' success={}",
            run.task_id, index, command, result.success
        );

        let mut record = CommandRecord::new(command, result.output.clone(), result.success);
        let stored_index = self.store.append_command(run.task_id, &record)?;

        if let Some(before_id) = before {
            match self.tracker.compare_and_capture(
                before_id,
                StateType::AfterCommand,
                StateContext::command(run.task_id, stored_index, command),
            ) {
                Ok((_, changes)) => {
                    self.store
                        .set_command_changes(run.task_id, stored_index, &changes)?;
                    record.filesystem_changes = Some(changes);
                }
                Err(err) => warn!("after_command snapshot failed: {}", err),
            }
        }

        run.records.push(record);
        run.final_output.push_str(&format!(
            "Command: {}\nOutput:\n{}\n\n",
            command, result.output
        ));
        Ok(result)
    }

    fn write_generated_file(&self, filename: &str, description: &str) -> StepResult {
        let generated = self.llm.generate_code(description, Some(filename));
        if !generated.success {
            return StepResult {
                success: false,
                output: generated
                    .error
                    .unwrap_or_else(|| "Code generation failed.".into()),
            };
        }
        let written = self.code.write_code_file(filename, &generated.code);
        if written.success {
            StepResult {
                success: true,
                output: format!("Created Python file: {}\n{}", filename, written.message),
            }
        } else {
            StepResult {
                success: false,
                output: written.message,
            }
        }
    }

    fn run_generated_code(&self, description: &str) -> StepResult {
        let generated = self.llm.generate_code(description, None);
        if !generated.success {
            return StepResult {
                success: false,
                output: generated
                    .error
                    .unwrap_or_else(|| "Code generation failed.".into()),
            };
        }
        let result = self.code.run_code(&generated.code, true);
        StepResult {
            success: result.success,
            output: format!("Python code execution:\n{}", result.output),
        }
    }

    fn finish(&self, run: &RunState, status: FinalStatus, error: Option<&str>) -> ShellResult<()> {
        let output = (!run.final_output.is_empty()).then_some(run.final_output.as_str());
        self.store
            .complete_task(run.task_id, status, output, error)?;
        if let Err(err) = self
            .tracker
            .capture(StateType::Final, StateContext::task(run.task_id))
        {
            warn!("Final snapshot for task {} failed: {}", run.task_id, err);
        }
        Ok(())
    }
}
