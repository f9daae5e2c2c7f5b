//! Runtime configuration loading and validation.
//!
//! Reads `toolchat.yaml` and resolves environment variables before parsing.
//! Every section is optional; missing keys fall back to the defaults below,
//! so an empty file (or no file at all) yields a working configuration.
//!
//! ```yaml
//! model:
//!   base_url: ${TOOLCHAT_BASE_URL:-http://localhost:11434/v1}
//!   model_name: qwen2.5:7b
//! loop:
//!   max_rounds: 10
//! confirmation:
//!   default_policy: ask
//!   category_policies:
//!     network_request: allow
//! markup:
//!   open: "<tool_call>"
//!   close: "</tool_call>"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;
use super::tool_call_parser::CallMarkup;
use crate::agent_core::conversation::TokenOptimization;
use crate::agent_core::permissions::ConfirmationPolicy;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Config file name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "toolchat.yaml";

/// Env var pointing directly at a config file.
pub const CONFIG_ENV_VAR: &str = "TOOLCHAT_CONFIG";

/// Default round cap per user turn.
pub const DEFAULT_MAX_ROUNDS: u32 = 10;

/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level runtime configuration (mirrors `toolchat.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub model: ModelConfig,
    #[serde(rename = "loop")]
    pub agent_loop: LoopConfig,
    pub confirmation: ConfirmationConfig,
    pub token_optimization: TokenOptimization,
    pub markup: CallMarkup,
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model_name: String,
    /// Sent as a bearer token when present and non-empty.
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Request a streamed (SSE) response.
    pub stream: bool,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model_name: "qwen2.5:7b".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 2048,
            stream: true,
            request_timeout_secs: 180,
        }
    }
}

/// Bounds on a single user turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Maximum dispatch rounds before the turn ends with `BUDGET_EXCEEDED`.
    pub max_rounds: u32,
    /// Optional wall-clock budget for the whole turn.
    pub wall_clock_secs: Option<u64>,
    /// Run the calls of one response concurrently instead of in order.
    pub parallel_dispatch: bool,
    /// Timeout for tools that do not declare their own.
    pub tool_timeout_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            wall_clock_secs: None,
            parallel_dispatch: false,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }
}

impl LoopConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn wall_clock(&self) -> Option<Duration> {
        self.wall_clock_secs.map(Duration::from_secs)
    }
}

/// Confirmation policy plus where remembered decisions are persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    #[serde(flatten)]
    pub policy: ConfirmationPolicy,
    /// JSON file for remembered decisions. `None` keeps them in memory.
    pub persist_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if !self.markup.is_valid() {
            return Err(InferenceError::ConfigError {
                reason: "markup.open and markup.close must be non-empty".into(),
            });
        }
        if self.markup.open == self.markup.close {
            return Err(InferenceError::ConfigError {
                reason: "markup.open and markup.close must differ".into(),
            });
        }
        if self.agent_loop.max_rounds == 0 {
            return Err(InferenceError::ConfigError {
                reason: "loop.max_rounds must be at least 1".into(),
            });
        }
        if self.agent_loop.tool_timeout_secs == 0 {
            return Err(InferenceError::ConfigError {
                reason: "loop.tool_timeout_secs must be at least 1".into(),
            });
        }
        if self.model.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.base_url must be set".into(),
            });
        }
        Ok(())
    }

    /// Load from the discovered config file, or defaults when none exists.
    pub fn discover(start: &Path) -> Result<Self, InferenceError> {
        match find_config_path(start) {
            Ok(path) => load_runtime_config(&path),
            Err(_) => {
                tracing::info!(start = %start.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `TOOLCHAT_CONFIG` wins when it names an existing file; otherwise the
/// search walks upward from `start` looking for `toolchat.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file");
    }

    find_upward(start).ok_or_else(|| InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME} above {}", start.display()),
    })
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Read, interpolate, parse and validate a config file.
pub fn load_runtime_config(path: &Path) -> Result<RuntimeConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = parse_runtime_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        model = %config.model.model_name,
        max_rounds = config.agent_loop.max_rounds,
        "loaded runtime config"
    );
    Ok(config)
}

/// Parse config text (after env interpolation) and validate it.
pub fn parse_runtime_config(raw: &str) -> Result<RuntimeConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(RuntimeConfig::default());
    }

    let config: RuntimeConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` from the process environment.
fn interpolate_env_vars(input: &str) -> String {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Replace `${VAR}` and `${VAR:-default}` using `lookup`. An unclosed `${`
/// is left as-is.
fn interpolate_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&resolve_var_expr(&after[..end], &lookup));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// `VAR` → its value or empty; `VAR:-default` → its value or the default.
fn resolve_var_expr(expr: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };
    match lookup(name.trim()) {
        Some(value) if !value.is_empty() => value,
        _ => default.map(expand_tilde).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
