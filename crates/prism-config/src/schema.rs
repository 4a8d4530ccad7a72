// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Named backend configurations, keyed by backend id
    /// (`openai`, `openrouter`, `anthropic`, `gemini`, `qwen-oauth`, `zai`).
    ///
    /// ```yaml
    /// backends:
    ///   openai:
    ///     api_key_env: OPENAI_API_KEY
    ///   openrouter:
    ///     api_key_env: OPENROUTER_API_KEY
    ///     base_url: https://openrouter.ai/api/v1
    /// ```
    #[serde(default)]
    pub backends: std::collections::HashMap<String, BackendEntry>,
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub edit_precision: EditPrecisionConfig,
    #[serde(default)]
    pub dangerous_commands: DangerousCommandsConfig,
    #[serde(default)]
    pub pytest: PytestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Total timeout for one upstream call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Client API key required on ingress requests.  `None` (or the
    /// `DISABLE_AUTH` env flag) disables the check.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backend used when neither the session nor the request names one.
    /// Overridden by the `LLM_BACKEND` environment variable.
    #[serde(default = "default_backend")]
    pub default_backend: String,
    /// Prefix that introduces in-band commands in user content.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Idle sessions are evicted after this many seconds.
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_true")]
    pub json_repair_enabled: bool,
    /// Soft cap on the repair buffer; exceeded buffers keep growing with a
    /// warning until the JSON value closes.
    #[serde(default = "default_repair_cap")]
    pub json_repair_buffer_cap_bytes: usize,
    #[serde(default)]
    pub json_repair_strict_mode: bool,
    #[serde(default)]
    pub disable_auth: bool,
    #[serde(default)]
    pub disable_accounting: bool,
    #[serde(default)]
    pub disable_health_checks: bool,
}

fn default_backend() -> String {
    "openai".to_string()
}

fn default_command_prefix() -> String {
    "!/".to_string()
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_repair_cap() -> usize {
    64 * 1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            command_prefix: default_command_prefix(),
            ttl_seconds: default_session_ttl(),
            json_repair_enabled: true,
            json_repair_buffer_cap_bytes: default_repair_cap(),
            json_repair_strict_mode: false,
            disable_auth: false,
            disable_accounting: false,
            disable_health_checks: false,
        }
    }
}

impl SessionConfig {
    /// Overlay the process environment on top of file-provided values.
    pub fn apply_env(&mut self) {
        if let Ok(backend) = std::env::var("LLM_BACKEND") {
            if !backend.trim().is_empty() {
                self.default_backend = backend;
            }
        }
        self.disable_auth |= env_flag("DISABLE_AUTH");
        self.disable_accounting |= env_flag("DISABLE_ACCOUNTING");
        self.disable_health_checks |= env_flag("DISABLE_HEALTH_CHECKS");
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Environment variable that holds the API key (read at runtime).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl BackendEntry {
    /// Resolve the effective API key: explicit value wins, then env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Application identity attached to outgoing requests as
/// `HTTP-Referer` / `X-Title` headers (OpenRouter attribution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub url: String,
    pub title: String,
}

/// Per-model temperature override applied in edit-precision mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTemperaturePattern {
    /// Substring to match in the model name (case-insensitive).
    pub pattern: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditPrecisionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_target_temperature")]
    pub target_temperature: f64,
    /// `None` leaves top_p untouched.
    #[serde(default = "default_min_top_p")]
    pub min_top_p: Option<f64>,
    #[serde(default)]
    pub model_patterns: Vec<ModelTemperaturePattern>,
    /// Additional failure-prompt regexes appended to the built-in set.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_target_temperature() -> f64 {
    0.1
}

fn default_min_top_p() -> Option<f64> {
    Some(0.3)
}

impl Default for EditPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_temperature: default_target_temperature(),
            min_top_p: default_min_top_p(),
            model_patterns: Vec::new(),
            extra_patterns: Vec::new(),
        }
    }
}

impl EditPrecisionConfig {
    /// Target temperature for a model, honoring per-model patterns.
    pub fn temperature_for_model(&self, model: &str) -> f64 {
        let lower = model.to_lowercase();
        for p in &self.model_patterns {
            if lower.contains(&p.pattern.to_lowercase()) {
                return p.temperature;
            }
        }
        self.target_temperature
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerousCommandsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tool names treated as local shell execution.
    #[serde(default = "default_shell_tools")]
    pub tool_names: Vec<String>,
    /// Replacement text for the steering response.  `None` uses the
    /// built-in message.
    #[serde(default)]
    pub steering_message: Option<String>,
}

fn default_shell_tools() -> Vec<String> {
    [
        "bash",
        "exec_command",
        "execute_command",
        "run_shell_command",
        "shell",
        "local_shell",
        "container.exec",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for DangerousCommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_names: default_shell_tools(),
            steering_message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PytestConfig {
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_true")]
    pub full_suite_steering_enabled: bool,
    /// A swallowed full-suite command re-issued within this window passes.
    #[serde(default = "default_full_suite_ttl")]
    pub full_suite_ttl_seconds: u64,
}

fn default_full_suite_ttl() -> u64 {
    600
}

impl Default for PytestConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            full_suite_steering_enabled: true,
            full_suite_ttl_seconds: default_full_suite_ttl(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
