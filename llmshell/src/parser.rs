use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const COMPLETION_SENTINEL: &str = "TASK_COMPLETE";
pub const WRITE_FILE_PREFIX: &str = "PYTHON_FILE:";
pub const RUN_CODE_PREFIX: &str = "PYTHON_CODE:";

const DEFAULT_SCRIPT_NAME: &str = "script.py";
const DEFAULT_SCRIPT_DESCRIPTION: &str = "Generate a Python script";
pub const JUDGMENT_PARSE_FAILURE: &str = "Failed to parse LLM response as JSON.";

/// What the model asked for in one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Complete,
    WriteFile {
        filename: String,
        description: String,
    },
    RunCode {
        description: String,
    },
    Command(String),
}

pub fn classify_reply(raw: &str) -> Reply {
    let reply = raw.trim();
    if reply == COMPLETION_SENTINEL {
        return Reply::Complete;
    }
    if let Some(rest) = reply.strip_prefix(WRITE_FILE_PREFIX) {
        let mut parts = rest.splitn(2, ':');
        let filename = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SCRIPT_NAME);
        let description = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SCRIPT_DESCRIPTION);
        return Reply::WriteFile {
            filename: filename.to_string(),
            description: description.to_string(),
        };
    }
    if let Some(rest) = reply.strip_prefix(RUN_CODE_PREFIX) {
        return Reply::RunCode {
            description: rest.trim().to_string(),
        };
    }
    Reply::Command(reply.to_string())
}

/// The model's verdict on whether the task is done.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Judgment {
    #[serde(default)]
    pub task_complete: bool,
    #[serde(default)]
    pub next_command: String,
    #[serde(default)]
    pub explanation: String,
}

impl Judgment {
    pub fn not_complete(explanation: impl Into<String>) -> Self {
        Self {
            task_complete: false,
            next_command: String::new(),
            explanation: explanation.into(),
        }
    }
}

/// Parses the span from the first `{` to the last `}`. Anything else
/// degrades to a "not complete" judgment.
pub fn parse_judgment(raw: &str) -> Judgment {
    let Some(segment) = outer_json_span(raw) else {
        debug!("No JSON object found in judgment reply");
        return Judgment::not_complete(JUDGMENT_PARSE_FAILURE);
    };
    match serde_json::from_str::<Judgment>(segment) {
        Ok(judgment) => judgment,
        Err(err) => {
            warn!("Failed parsing judgment JSON: {}", err);
            Judgment::not_complete(JUDGMENT_PARSE_FAILURE)
        }
    }
}

fn outer_json_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Removes a leading ```` ```python ```` / ```` ``` ```` fence and a trailing
/// ```` ``` ```` fence from generated code.
pub fn strip_code_fence(raw: &str) -> String {
    let mut code = raw.trim();
    if let Some(rest) = code.strip_prefix("```python") {
        code = rest.trim();
    }
    if let Some(rest) = code.strip_prefix("```") {
        code = rest.trim();
    }
    if let Some(rest) = code.strip_suffix("```") {
        code = rest.trim();
    }
    code.to_string()
}
