use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SoulError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Model request timed out")]
    ModelTimeout,

    #[error("Model error: {0}")]
    ModelFatal(String),

    #[error("Turn failed after {attempts} attempt(s): {reason}")]
    FatalTurn { attempts: u32, reason: String },

    #[error("Capacity exceeded: entry needs {entry_tokens} tokens, ceiling is {max_tokens}")]
    CapacityExceeded {
        entry_tokens: usize,
        max_tokens: usize,
    },

    #[error("Tool execution error: tool={tool_name}, {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session log is locked by another writer: {}", path.display())]
    SessionLocked { path: PathBuf },

    #[error("Corrupt session log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SoulError {
    /// Whether a model call that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SoulError::Provider(_) | SoulError::RateLimited { .. } | SoulError::ModelTimeout
        )
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SoulError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

pub type SoulResult<T> = Result<T, SoulError>;
