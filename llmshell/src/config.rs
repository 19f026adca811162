use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use log::{LevelFilter, debug, info, trace, warn};
use serde::Deserialize;

use crate::allowlist::AllowlistConfig;

const DEFAULT_API_URL: &str = "http://localhost:11434/api/chat";
const DEFAULT_MODEL: &str = "mistral-nemo:12b-instruct-2409-fp16";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_CONTEXT_LENGTH: u32 = 8192;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CODE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_COMMANDS: usize = 10;
const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_PYTHON: &str = "python3";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
    pub context_length: u32,
    pub timeout_seconds: u64,
    pub code_timeout_seconds: u64,
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub max_commands: usize,
    pub shell: String,
    pub python: String,
    pub allowlist: AllowlistConfig,
    pub offline_mode: bool,
    pub log_level: LevelFilter,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    context_length: Option<u32>,
    timeout_seconds: Option<u64>,
    code_timeout_seconds: Option<u64>,
    workspace_root: Option<String>,
    data_dir: Option<String>,
    database_path: Option<String>,
    max_commands: Option<usize>,
    shell: Option<String>,
    python: Option<String>,
    allowed_commands: Option<Vec<String>>,
    offline_mode: Option<bool>,
    log_level: Option<String>,
}

impl AppConfig {
    /// Defaults only, rooted at `workspace_root`. No file or environment lookups.
    pub fn with_root(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let data_dir = workspace_root.join(".llmshell");
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            context_length: DEFAULT_CONTEXT_LENGTH,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            code_timeout_seconds: DEFAULT_CODE_TIMEOUT_SECS,
            database_path: data_dir.join("llmshell.db"),
            data_dir,
            workspace_root,
            max_commands: DEFAULT_MAX_COMMANDS,
            shell: DEFAULT_SHELL.to_string(),
            python: DEFAULT_PYTHON.to_string(),
            allowlist: AllowlistConfig::default(),
            offline_mode: false,
            log_level: LevelFilter::Info,
        }
    }

    pub fn load() -> Result<Self> {
        info!("Loading application configuration");
        trace!("Reading file config");
        let file_cfg = read_file_config()?;
        Self::resolve(file_cfg)
    }

    fn resolve(file_cfg: FileConfig) -> Result<Self> {
        let api_url = env_value("OLLAMA_API_URL")
            .or(file_cfg.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        info!("API URL: {}", api_url);

        let model = env_value("OLLAMA_MODEL_NAME")
            .or(file_cfg.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        info!("Model: {}", model);

        let temperature = env_parsed::<f32>("OLLAMA_TEMPERATURE")?
            .or(file_cfg.temperature)
            .unwrap_or(DEFAULT_TEMPERATURE);
        let context_length = env_parsed::<u32>("OLLAMA_CONTEXT_LENGTH")?
            .or(file_cfg.context_length)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);
        debug!(
            "Sampling: temperature={}, context_length={}",
            temperature, context_length
        );

        let timeout_seconds = env_parsed::<u64>("TIMEOUT_SECONDS")?
            .or(file_cfg.timeout_seconds)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let code_timeout_seconds = file_cfg
            .code_timeout_seconds
            .unwrap_or(DEFAULT_CODE_TIMEOUT_SECS);
        debug!(
            "Timeouts: command/request={}s, code={}s",
            timeout_seconds, code_timeout_seconds
        );

        let workspace_root = match env_value("LLMSHELL_WORKSPACE").or(file_cfg.workspace_root) {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir().context("failed resolving current directory")?,
        };
        info!("Workspace root: {}", workspace_root.display());

        let data_dir = resolve_data_dir(file_cfg.data_dir.as_deref());
        let database_path = env_value("DATABASE_PATH")
            .or(file_cfg.database_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("llmshell.db"));
        info!("Database: {}", database_path.display());

        let max_commands = env_parsed::<usize>("LLMSHELL_MAX_COMMANDS")?
            .or(file_cfg.max_commands)
            .unwrap_or(DEFAULT_MAX_COMMANDS);
        if max_commands == 0 {
            warn!("max_commands is 0; tasks will stop before running anything");
        }

        let shell = file_cfg
            .shell
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        let python = env_value("LLMSHELL_PYTHON")
            .or(file_cfg.python)
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string());
        debug!("Shell: {}, python: {}", shell, python);

        let allowlist = file_cfg
            .allowed_commands
            .map(|commands| AllowlistConfig { commands })
            .unwrap_or_default();
        debug!("Allow-list: {:?}", allowlist.commands);

        let offline_mode = resolve_bool("LLMSHELL_OFFLINE")
            .or(file_cfg.offline_mode)
            .unwrap_or(false);
        if offline_mode {
            warn!("Offline mode enabled");
        }

        let log_level = match env_value("LLMSHELL_LOG_LEVEL").or(file_cfg.log_level) {
            Some(raw) => LevelFilter::from_str(&raw)
                .map_err(|_| anyhow!("invalid log level '{raw}'"))?,
            None => LevelFilter::Info,
        };

        info!("Configuration loaded successfully");
        Ok(Self {
            api_url,
            model,
            temperature,
            context_length,
            timeout_seconds,
            code_timeout_seconds,
            workspace_root,
            data_dir,
            database_path,
            max_commands,
            shell,
            python,
            allowlist,
            offline_mode,
            log_level,
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("llmshell.log")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("llmshell.history.sh")
    }
}

fn read_file_config() -> Result<FileConfig> {
    let Some(path) = config_file_path() else {
        debug!("No config file path found, using defaults");
        return Ok(FileConfig::default());
    };

    if !path.exists() {
        debug!(
            "Config file does not exist: {}, using defaults",
            path.display()
        );
        return Ok(FileConfig::default());
    }

    info!("Reading config file: {}", path.display());
    parse_file_config(&path)
}

fn parse_file_config(path: &Path) -> Result<FileConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    trace!("Parsing TOML config");
    toml::from_str(&data).with_context(|| {
        format!(
            "invalid TOML in {} (make sure string values are quoted)",
            path.display()
        )
    })
}

fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = env_value("LLMSHELL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("llmshell").join("config.toml"))
}

fn resolve_data_dir(file_override: Option<&str>) -> PathBuf {
    if let Some(env_path) = env_value("LLMSHELL_DATA_DIR") {
        return PathBuf::from(env_path);
    }
    if let Some(path) = file_override {
        return PathBuf::from(path);
    }
    let base = dirs::data_dir().or_else(|| dirs::home_dir().map(|h| h.join(".local/share")));
    base.unwrap_or_else(|| PathBuf::from(".")).join("llmshell")
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    env_value(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| anyhow!("invalid value for {name}: '{raw}'"))
        })
        .transpose()
}

fn resolve_bool(name: &str) -> Option<bool> {
    let val = env_value(name)?;
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
model = "llama3"
max_commands = 4
allowed_commands = ["ls", "echo"]
"#,
        )
        .unwrap();
        let cfg = parse_file_config(&path).unwrap();
        assert_eq!(cfg.model.as_deref(), Some("llama3"));
        assert_eq!(cfg.max_commands, Some(4));
        assert_eq!(
            cfg.allowed_commands,
            Some(vec!["ls".to_string(), "echo".to_string()])
        );
        assert!(cfg.api_url.is_none());
    }

    #[test]
    fn rejects_unquoted_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "model = llama3\n").unwrap();
        let err = parse_file_config(&path).unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
    }

    #[test]
    fn defaults_are_rooted_at_workspace() {
        let cfg = AppConfig::with_root("/work");
        assert_eq!(cfg.max_commands, 10);
        assert_eq!(cfg.timeout_seconds, 120);
        assert_eq!(cfg.database_path, PathBuf::from("/work/.llmshell/llmshell.db"));
        assert!(cfg.allowlist.commands.iter().any(|c| c == "echo"));
    }
}
