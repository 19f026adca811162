use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("completion backend request failed: {0}")]
    Transport(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("failed parsing model output: {0}")]
    Parse(String),
    #[error("{kind} with ID {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("sqlite error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    pub fn task_not_found(id: i64) -> Self {
        Self::NotFound { kind: "Task", id }
    }

    pub fn state_not_found(id: i64) -> Self {
        Self::NotFound {
            kind: "Filesystem state",
            id,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type ShellResult<T> = Result<T, ShellError>;
