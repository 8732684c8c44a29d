use thiserror::Error;

use crate::agent_engine::stage::Stage;
use crate::vision::types::SchemaError;

#[derive(Debug, Error)]
pub enum NavError {
    #[error("Action schema violation: {0}")]
    Schema(#[from] SchemaError),

    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Vision provider error: {0}")]
    Vision(String),

    #[error("Stage {stage} exhausted its stall budget after {attempts} attempts")]
    StallExhausted { stage: Stage, attempts: u32 },

    #[error("Global step budget exceeded after {steps} steps")]
    StepBudgetExceeded { steps: u32 },

    #[error("Fatal collaborator failure: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl NavError {
    /// Short machine-readable kind, used in the final run report.
    pub fn kind(&self) -> &'static str {
        match self {
            NavError::Schema(_) => "schema",
            NavError::Driver(_) => "driver",
            NavError::Vision(_) => "vision",
            NavError::StallExhausted { .. } => "stall_exhausted",
            NavError::StepBudgetExceeded { .. } => "step_budget_exceeded",
            NavError::Fatal(_) => "fatal",
            NavError::Config(_) => "config",
            NavError::Cancelled => "cancelled",
            NavError::Io(_) => "io",
            NavError::Json(_) => "json",
            NavError::Http(_) => "http",
            NavError::TomlDe(_) => "toml",
        }
    }
}

pub type NavResult<T> = Result<T, NavError>;
