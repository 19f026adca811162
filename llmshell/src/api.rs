use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, trace, warn};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::conversation::{ChatMessage, Conversation};
use crate::error::{ShellError, ShellResult};
use crate::models::CommandRecord;
use crate::parser::{self, COMPLETION_SENTINEL, Judgment};

const CODE_PROMPT: &str = "You are an AI assistant specialized in writing Python code. \
Generate clean, well-documented, and efficient Python code based on the user's requirements. \
Only respond with the Python code itself, without any markdown formatting, explanations, or comments outside the code. \
Include appropriate docstrings and comments inside the code. \
Make sure the code is complete, correct, and ready to execute.";

const JUDGE_PROMPT: &str = "You are an AI assistant that helps analyze shell command outputs and determine next steps. \
Based on the task, command executed, and its output, determine if the task is complete or what command should be executed next. \
Provide your assessment and, if the task is not complete, suggest the next command to run.";

/// A chat-completion service: messages in, assistant text out.
pub trait CompletionBackend: Send + Sync {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Clone)]
pub struct OllamaClient {
    inner: ClientMode,
}

#[derive(Clone)]
enum ClientMode {
    Remote(RemoteClient),
    Offline,
}

#[derive(Clone)]
struct RemoteClient {
    http: Client,
    api_url: String,
    model: String,
    temperature: f32,
    context_length: u32,
}

impl OllamaClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        info!("Creating completion client");
        if config.offline_mode {
            warn!("Running in offline mode - every reply is {}", COMPLETION_SENTINEL);
            return Ok(Self::offline());
        }

        trace!("Building HTTP client");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            "Completion client created: api_url={}, model={}",
            config.api_url, config.model
        );
        Ok(Self {
            inner: ClientMode::Remote(RemoteClient {
                http,
                api_url: config.api_url.clone(),
                model: config.model.clone(),
                temperature: config.temperature,
                context_length: config.context_length,
            }),
        })
    }

    pub fn offline() -> Self {
        Self {
            inner: ClientMode::Offline,
        }
    }
}

impl CompletionBackend for OllamaClient {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        match &self.inner {
            ClientMode::Remote(remote) => remote.chat(messages),
            ClientMode::Offline => {
                debug!("Offline completion for {} messages", messages.len());
                Ok(COMPLETION_SENTINEL.to_string())
            }
        }
    }
}

impl RemoteClient {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
                num_ctx: self.context_length,
            },
        };

        info!(
            "Sending POST request to {} ({} messages)",
            self.api_url,
            messages.len()
        );
        let resp = self
            .http
            .post(&self.api_url)
            .json(&request)
            .send()
            .with_context(|| format!("failed sending chat request to {}", self.api_url))?;

        let status = resp.status();
        debug!("Received response: status={}", status.as_u16());
        let raw_body = resp.text().context("failed to read chat response body")?;

        if !status.is_success() {
            let snippet: String = raw_body.chars().take(500).collect();
            error!("Chat request failed with {}: {}", status.as_u16(), snippet);
            return Err(anyhow!("completion backend {}: {}", status.as_u16(), snippet));
        }

        trace!("Parsing JSON response ({} bytes)", raw_body.len());
        let body: ChatResponse =
            serde_json::from_str(&raw_body).context("failed to decode chat response body")?;
        let text = body
            .message
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        debug!("Reply text: {}", text.chars().take(200).collect::<String>());
        Ok(text)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_ctx: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeGeneration {
    pub success: bool,
    pub code: String,
    pub prompt: String,
    pub file_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The three conversations the orchestrator has with the model.
#[derive(Clone)]
pub struct LlmService {
    backend: Arc<dyn CompletionBackend>,
}

impl LlmService {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// Next shell command (or sentinel/directive) for the conversation so far.
    /// A transport failure is an `Err`, never text.
    pub fn generate_next_command(&self, conversation: &Conversation) -> ShellResult<String> {
        trace!(
            "Requesting next command (~{} tokens)",
            conversation.approximate_tokens()
        );
        self.backend
            .complete(conversation.messages())
            .map(|text| text.trim().to_string())
            .map_err(|err| {
                error!("Failed requesting next command: {:#}", err);
                ShellError::Transport(format!("{err:#}"))
            })
    }

    pub fn generate_code(&self, description: &str, file_hint: Option<&str>) -> CodeGeneration {
        let mut user = format!("Write Python code for the following task: {description}");
        if let Some(hint) = file_hint {
            user.push_str(&format!(
                "\n\nThis code will be saved to a file with the following description: {hint}"
            ));
        }
        let messages = [ChatMessage::system(CODE_PROMPT), ChatMessage::user(user)];

        info!("Generating code for: {}", description);
        match self.backend.complete(&messages) {
            Ok(raw) => CodeGeneration {
                success: true,
                code: parser::strip_code_fence(&raw),
                prompt: description.to_string(),
                file_description: file_hint.map(str::to_string),
                error: None,
            },
            Err(err) => {
                warn!("Code generation failed: {:#}", err);
                CodeGeneration {
                    success: false,
                    code: String::new(),
                    prompt: description.to_string(),
                    file_description: file_hint.map(str::to_string),
                    error: Some(format!("{err:#}")),
                }
            }
        }
    }

    /// Asks the model whether the task is done. Never fails: transport and
    /// parse problems come back as a "not complete" judgment.
    pub fn analyze_outcome(
        &self,
        task: &str,
        last_command: &str,
        last_output: &str,
        prior_commands: &[CommandRecord],
    ) -> Judgment {
        let prior: Vec<_> = prior_commands
            .iter()
            .map(|c| {
                serde_json::json!({
                    "command": c.command,
                    "output": c.output,
                    "success": c.success,
                })
            })
            .collect();
        let prior_json = serde_json::to_string_pretty(&prior).unwrap_or_else(|_| "[]".into());
        let user = format!(
            "Task: {task}\n\n\
             Command executed: {last_command}\n\n\
             Command output: {last_output}\n\n\
             Previous commands: {prior_json}\n\n\
             Is the task complete? If not, what should be the next command to execute? \
             Respond with a JSON object with the following structure:\n\
             {{\n  \"task_complete\": true/false,\n  \
             \"next_command\": \"command to execute if task is not complete\",\n  \
             \"explanation\": \"brief explanation of your assessment\"\n}}"
        );
        let messages = [ChatMessage::system(JUDGE_PROMPT), ChatMessage::user(user)];

        match self.backend.complete(&messages) {
            Ok(raw) => {
                let judgment = parser::parse_judgment(&raw);
                debug!(
                    "Judgment: complete={}, explanation={}",
                    judgment.task_complete, judgment.explanation
                );
                judgment
            }
            Err(err) => {
                warn!("Outcome analysis failed: {:#}", err);
                Judgment::not_complete(format!("Error analyzing command result: {err:#}"))
            }
        }
    }
}
