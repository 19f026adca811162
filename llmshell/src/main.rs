use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use llmshell::config::AppConfig;
use llmshell::logger::FileLogger;
use llmshell::service::{DEFAULT_RECENT_LIMIT, Service};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory commands run in and snapshots cover (defaults to the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Never contact the model; every reply is the completion sentinel
    #[arg(long, global = true)]
    offline: bool,

    /// Override the model name from configuration
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a natural-language task to completion
    Run {
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },
    /// List the most recent tasks
    Tasks {
        #[arg(long, default_value_t = DEFAULT_RECENT_LIMIT)]
        limit: usize,
    },
    /// Show a task with its filesystem history
    Show { id: i64 },
    /// Record a snapshot of the workspace
    Snapshot,
    /// Compare the workspace against a stored state
    Compare { state_id: i64 },
    /// Run one allow-listed command outside any task
    Exec {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run Python code
    RunCode {
        /// Pass the code with -c instead of through a temporary file
        #[arg(long)]
        inline: bool,
        code: String,
    },
    /// Write a file inside the workspace
    WriteFile { path: String, content: String },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if let Some(workspace) = cli.workspace {
        config.workspace_root = workspace;
    }
    if cli.offline {
        config.offline_mode = true;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }

    if let Err(err) = FileLogger::init(&config.log_path(), config.log_level) {
        eprintln!(
            "Warning: logging disabled, could not open {}: {}",
            config.log_path().display(),
            err
        );
    }
    info!("llmshell starting: {:?}", cli.command);

    let service = Service::from_config(&config)?;
    let success = match cli.command {
        Cmd::Run { task } => {
            let outcome = service.execute_task(&task.join(" "))?;
            print_json(&outcome)?;
            outcome.success
        }
        Cmd::Tasks { limit } => print_json(&service.get_recent_tasks(limit)?)?,
        Cmd::Show { id } => print_json(&service.get_task_history(id)?)?,
        Cmd::Snapshot => {
            let state_id = service.snapshot_filesystem()?;
            print_json(&serde_json::json!({ "state_id": state_id }))?
        }
        Cmd::Compare { state_id } => print_json(&service.compare_filesystem(state_id)?)?,
        Cmd::Exec { command } => {
            let result = service.run_command(&command.join(" "));
            print_json(&result)?;
            result.success
        }
        Cmd::RunCode { inline, code } => {
            let result = service.run_code(&code, !inline);
            print_json(&result)?;
            result.success
        }
        Cmd::WriteFile { path, content } => {
            let result = service.write_code_file(&path, &content);
            print_json(&result)?;
            result.success
        }
    };

    log::logger().flush();
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<bool> {
    let text = serde_json::to_string_pretty(value).context("failed serializing output")?;
    println!("{text}");
    Ok(true)
}
