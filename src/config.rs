use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::NavResult;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Target repository as `owner/repo`.
    #[serde(default = "default_target_repo")]
    pub target_repo: String,
    #[serde(default = "default_start_url")]
    pub start_url: String,
    /// Hard cap on loop iterations across the whole run.
    #[serde(default = "default_step_budget")]
    pub step_budget: u32,
    /// Consecutive stalls tolerated per stage before recovery kicks in.
    #[serde(default = "default_stall_budget")]
    pub stall_budget: u32,
    /// Candidate grid is `grid_size × grid_size` per exploration round.
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
    #[serde(default = "default_round_budget")]
    pub round_budget: u32,
    /// Per-collaborator-call timeout.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional API key stored in config.toml (falls back to env var OPENAI_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub chrome_executable: Option<String>,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    /// Settle delay after each input primitive, in milliseconds.
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trace_dir")]
    pub base_dir: String,
}

fn default_target_repo() -> String {
    "openclaw/openclaw".into()
}

fn default_start_url() -> String {
    "https://github.com".into()
}

fn default_step_budget() -> u32 {
    25
}

fn default_stall_budget() -> u32 {
    3
}

fn default_grid_size() -> u32 {
    3
}

fn default_round_budget() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    45
}

fn default_api_base() -> String {
    "https://api.openai.com/v1/chat/completions".into()
}

fn default_model() -> String {
    "gpt-5-mini".into()
}

fn default_viewport_width() -> u32 {
    1280
}

fn default_viewport_height() -> u32 {
    720
}

fn default_action_delay_ms() -> u64 {
    250
}

fn default_trace_dir() -> String {
    "runs".into()
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_repo: default_target_repo(),
            start_url: default_start_url(),
            step_budget: default_step_budget(),
            stall_budget: default_stall_budget(),
            grid_size: default_grid_size(),
            round_budget: default_round_budget(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            api_key: None,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            action_delay_ms: default_action_delay_ms(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_trace_dir(),
        }
    }
}

impl VisionConfig {
    /// Key from config.toml, or the OPENAI_API_KEY environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Some(candidate);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join("config.toml");
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in working directory");
            return Some(candidate);
        }
    }

    None
}

/// Loads config.toml from next to the executable or the working directory.
/// A missing file is not an error; every field has a default.
pub fn load_config() -> NavResult<AppConfig> {
    let mut config = match resolve_config_path() {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            let config: AppConfig = toml::from_str(&content)?;
            tracing::info!(path = %path.display(), model = %config.vision.model, "config loaded");
            config
        }
        None => {
            tracing::info!("no config.toml found; using defaults");
            AppConfig::default()
        }
    };
    // Environment beats the file; CLI flags beat both (applied by the caller).
    if let Ok(model) = std::env::var("OPENAI_MODEL_VLM") {
        config.vision.model = model;
    }
    Ok(config)
}
