use std::io::{ErrorKind, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use wait_timeout::ChildExt;

use crate::allowlist::{Allowlist, AllowlistError};
use crate::history::CommandHistory;

/// Outcome of one command. Failures of every kind end up here rather than
/// in an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
}

impl CommandResult {
    pub fn failure(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            command: command.into(),
            return_code: None,
        }
    }
}

/// Raw output of a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub return_code: Option<i32>,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// stdout followed by stderr, separated by a newline when both are present.
    pub fn combined(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.into_owned(),
            (true, false) => stderr.into_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// The process layer. Swapped out in tests to observe what gets spawned.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, cmd: Command, timeout: Duration) -> Result<ProcessOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, cmd: Command, timeout: Duration) -> Result<ProcessOutput> {
        run_with_timeout(cmd, timeout)
    }
}

/// How long to keep collecting output after the process group was killed.
const KILL_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK_BYTES: usize = 8 * 1024;

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Closed,
}

#[derive(Default)]
struct Collected {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    open: usize,
}

/// Spawn `cmd` in its own process group, stream both pipes back over a
/// channel and kill the whole group once `timeout` elapses.
///
/// Output is only collected until the deadline. A background process that
/// keeps a pipe open past it is killed with the rest of the group.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    trace!("Spawning child process: {:?}", cmd);
    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn().context("failed to spawn process")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let (tx, rx) = mpsc::channel();
    spawn_reader(stdout, tx.clone(), Chunk::Stdout);
    spawn_reader(stderr, tx, Chunk::Stderr);
    let mut output = Collected {
        open: 2,
        ..Collected::default()
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("failed waiting for process")? {
        Some(status) => status,
        None => {
            warn!("Process exceeded {}s, killing its group", timeout.as_secs());
            timed_out = true;
            kill_group(child.id());
            // The child may already have exited between the wait and the kill.
            let _ = child.kill();
            child.wait().context("failed waiting for killed process")?
        }
    };

    if timed_out {
        drain(&rx, &mut output, Instant::now() + KILL_GRACE);
    } else {
        drain(&rx, &mut output, deadline);
        if output.open > 0 {
            warn!(
                "Output still open {}s after start, killing leftover processes",
                timeout.as_secs()
            );
            kill_group(child.id());
            drain(&rx, &mut output, Instant::now() + KILL_GRACE);
        }
    }

    debug!(
        "Process finished: exit_code={:?}, timed_out={}, stdout_len={}, stderr_len={}",
        status.code(),
        timed_out,
        output.stdout.len(),
        output.stderr.len()
    );

    Ok(ProcessOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        return_code: status.code(),
        timed_out,
    })
}

fn spawn_reader<R>(mut stream: R, tx: Sender<Chunk>, wrap: fn(Vec<u8>) -> Chunk)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!("Pipe read failed: {}", err);
                    break;
                }
            }
        }
        let _ = tx.send(Chunk::Closed);
    });
}

/// Collects chunks until both pipes close or `until` passes.
fn drain(rx: &Receiver<Chunk>, output: &mut Collected, until: Instant) {
    while output.open > 0 {
        let now = Instant::now();
        if now >= until {
            break;
        }
        match rx.recv_timeout(until - now) {
            Ok(Chunk::Stdout(bytes)) => output.stdout.extend_from_slice(&bytes),
            Ok(Chunk::Stderr(bytes)) => output.stderr.extend_from_slice(&bytes),
            Ok(Chunk::Closed) => output.open -= 1,
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => output.open = 0,
        }
    }
}

/// The child leads its own group, so its pid is the group id.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[derive(Clone)]
pub struct Executor {
    allowlist: Allowlist,
    shell: String,
    timeout: Duration,
    default_cwd: Option<PathBuf>,
    runner: Arc<dyn ProcessRunner>,
    history: Option<CommandHistory>,
}

impl Executor {
    pub fn new(allowlist: Allowlist, shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            allowlist,
            shell: shell.into(),
            timeout,
            default_cwd: None,
            runner: Arc::new(SystemRunner),
            history: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_history(mut self, history: CommandHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Directory used when `execute` is called without an explicit `cwd`.
    pub fn with_default_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.default_cwd = Some(cwd.into());
        self
    }

    pub fn validate(&self, command: &str) -> Result<(), AllowlistError> {
        self.allowlist.evaluate(command)
    }

    pub fn execute(&self, command: &str, cwd: Option<&Path>) -> CommandResult {
        if let Err(err) = self.validate(command) {
            warn!("Rejected command '{}': {}", command, err);
            return CommandResult::failure(command, err.to_string());
        }

        let cwd = cwd.or(self.default_cwd.as_deref());
        info!("Running command: {} (shell: {})", command, self.shell);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let result = match self.runner.run(cmd, self.timeout) {
            Ok(out) if out.timed_out => CommandResult::failure(
                command,
                format!("Command timed out after {} seconds.", self.timeout.as_secs()),
            ),
            Ok(out) => CommandResult {
                success: out.return_code == Some(0),
                output: out.combined(),
                command: command.to_string(),
                return_code: out.return_code,
            },
            Err(err) => {
                warn!("Command '{}' could not be executed: {:#}", command, err);
                CommandResult::failure(command, format!("Error executing command: {err:#}"))
            }
        };

        if let Some(history) = &self.history
            && let Err(err) = history.record(command, cwd, &result.output, result.return_code)
        {
            warn!(
                "Failed writing command history {}: {}",
                history.path().display(),
                err
            );
        }
        result
    }

    /// Runs commands in order and stops after the first failure. The failing
    /// result is the last element.
    pub fn execute_sequence<S: AsRef<str>>(
        &self,
        commands: &[S],
        cwd: Option<&Path>,
    ) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = self.execute(command.as_ref(), cwd);
            let failed = !result.success;
            results.push(result);
            if failed {
                debug!("Sequence stopped after {} command(s)", results.len());
                break;
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::AllowlistConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SpyRunner {
        calls: Mutex<Vec<String>>,
    }

    impl ProcessRunner for SpyRunner {
        fn run(&self, cmd: Command, _timeout: Duration) -> Result<ProcessOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{:?}", cmd.get_args().collect::<Vec<_>>()));
            Ok(ProcessOutput {
                stdout: b"spy".to_vec(),
                return_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn executor() -> Executor {
        Executor::new(Allowlist::default(), "/bin/sh", Duration::from_secs(10))
    }

    #[test]
    fn runs_echo_command() {
        let result = executor().execute("echo hello-world", None);
        assert!(result.success);
        assert_eq!(result.return_code, Some(0));
        assert!(result.output.contains("hello-world"));
    }

    #[test]
    fn disallowed_command_never_reaches_process_layer() {
        let spy = Arc::new(SpyRunner::default());
        let executor = executor().with_runner(spy.clone());

        let result = executor.execute("curl http://example.com", None);
        assert!(!result.success);
        assert_eq!(result.output, "Command 'curl' is not allowed.");
        assert!(result.return_code.is_none());

        let empty = executor.execute("  ", None);
        assert!(!empty.success);
        assert_eq!(empty.output, "Empty command.");
        assert!(spy.calls.lock().unwrap().is_empty());

        assert!(executor.execute("ls", None).success);
        assert_eq!(spy.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn non_zero_exit_is_failure_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor().execute("ls does-not-exist", Some(dir.path()));
        assert!(!result.success);
        assert_ne!(result.return_code, Some(0));
        assert!(!result.output.is_empty());
    }

    #[test]
    fn timeout_reports_sentinel_message() {
        let cfg = AllowlistConfig {
            commands: vec!["sleep".into()],
        };
        let executor = Executor::new(
            Allowlist::from_config(cfg),
            "/bin/sh",
            Duration::from_secs(1),
        );
        let result = executor.execute("sleep 5", None);
        assert!(!result.success);
        assert_eq!(result.output, "Command timed out after 1 seconds.");
    }

    fn sleepy_executor(timeout: Duration) -> Executor {
        let cfg = AllowlistConfig {
            commands: vec!["sleep".into()],
        };
        Executor::new(Allowlist::from_config(cfg), "/bin/sh", timeout)
    }

    #[test]
    fn timeout_kills_grandchildren() {
        let started = Instant::now();
        let result = sleepy_executor(Duration::from_secs(1)).execute("sleep 8; echo done", None);
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert!(!result.success);
        assert_eq!(result.output, "Command timed out after 1 seconds.");
    }

    #[test]
    fn background_process_cannot_hold_the_pipes_open() {
        let started = Instant::now();
        let result =
            sleepy_executor(Duration::from_secs(2)).execute("sleep 30 & echo started", None);
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
        // the shell itself exited cleanly before the deadline
        assert!(result.success);
        assert_eq!(result.return_code, Some(0));
        assert!(result.output.contains("started"));
    }

    #[test]
    fn output_written_before_exit_is_kept() {
        let out = run_with_timeout(
            {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg("echo out; echo err >&2; exit 4");
                cmd
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!out.timed_out);
        assert_eq!(out.return_code, Some(4));
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
    }

    #[test]
    fn spawn_error_is_reported_as_output() {
        let executor = Executor::new(
            Allowlist::default(),
            "/definitely/not/a/shell",
            Duration::from_secs(5),
        );
        let result = executor.execute("echo hi", None);
        assert!(!result.success);
        assert!(result.output.starts_with("Error executing command:"));
    }

    #[test]
    fn sequence_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let results = executor().execute_sequence(
            &["echo one", "ls missing-file", "echo three"],
            Some(dir.path()),
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
    }

    #[test]
    fn combines_stdout_and_stderr() {
        let out = ProcessOutput {
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            return_code: Some(1),
            timed_out: false,
        };
        assert_eq!(out.combined(), "out\nerr");
    }

    #[test]
    fn writes_history_for_spawned_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.sh");
        let history = CommandHistory::open(path.clone()).unwrap();
        let executor = executor().with_history(history);

        executor.execute("echo logged", Some(dir.path()));
        executor.execute("curl nope", None);

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("echo logged"));
        assert!(!content.contains("curl"));
    }
}
