// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Immutable session state.
//!
//! Every mutation returns a new value through a `with_*` helper; the session
//! store swaps the state pointer under a per-session lock.  Equality is by
//! value, so a command sequence applied twice from the same starting state
//! yields equal results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// History retention bound per session.
pub const MAX_HISTORY_ENTRIES: usize = 1000;

// ─── Failover routes ──────────────────────────────────────────────────────────

/// Route element policy: key-preserving or model-only rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePolicy {
    K,
    M,
}

impl RoutePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "k" => Some(Self::K),
            "m" => Some(Self::M),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::K => "k",
            Self::M => "m",
        }
    }
}

/// A named, ordered list of `backend:model` targets attempted in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRoute {
    pub name: String,
    pub policy: RoutePolicy,
    #[serde(default)]
    pub elements: Vec<String>,
}

impl FailoverRoute {
    pub fn new(name: impl Into<String>, policy: RoutePolicy) -> Self {
        Self { name: name.into(), policy, elements: Vec::new() }
    }
}

// ─── Configuration records ────────────────────────────────────────────────────

/// Backend selection and routing configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub backend_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub openai_url: Option<String>,
    #[serde(default)]
    pub interactive_mode: bool,
    /// One-shot override pair; either both set or both unset, consumed by
    /// the next request exactly once.
    #[serde(default)]
    pub oneoff_backend: Option<String>,
    #[serde(default)]
    pub oneoff_model: Option<String>,
    #[serde(default)]
    pub failover_routes: BTreeMap<String, FailoverRoute>,
}

impl BackendConfig {
    pub fn with_backend(&self, backend: Option<String>) -> Self {
        Self { backend_type: backend, ..self.clone() }
    }

    pub fn with_model(&self, model: Option<String>) -> Self {
        Self { model, ..self.clone() }
    }

    pub fn with_backend_and_model(&self, backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend_type: Some(backend.into()),
            model: Some(model.into()),
            ..self.clone()
        }
    }

    pub fn without_override(&self) -> Self {
        Self { backend_type: None, model: None, ..self.clone() }
    }

    pub fn with_openai_url(&self, url: Option<String>) -> Self {
        Self { openai_url: url, ..self.clone() }
    }

    pub fn with_interactive_mode(&self, enabled: bool) -> Self {
        Self { interactive_mode: enabled, ..self.clone() }
    }

    pub fn with_oneoff_route(&self, backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            oneoff_backend: Some(backend.into()),
            oneoff_model: Some(model.into()),
            ..self.clone()
        }
    }

    pub fn without_oneoff_route(&self) -> Self {
        Self { oneoff_backend: None, oneoff_model: None, ..self.clone() }
    }

    pub fn has_oneoff_route(&self) -> bool {
        self.oneoff_backend.is_some() && self.oneoff_model.is_some()
    }

    pub fn with_route(&self, route: FailoverRoute) -> Self {
        let mut routes = self.failover_routes.clone();
        routes.insert(route.name.clone(), route);
        Self { failover_routes: routes, ..self.clone() }
    }

    pub fn without_route(&self, name: &str) -> Self {
        let mut routes = self.failover_routes.clone();
        routes.remove(name);
        Self { failover_routes: routes, ..self.clone() }
    }
}

/// Sampling and reasoning configuration applied to outgoing requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub generation_config: Option<serde_json::Map<String, Value>>,
}

impl ReasoningConfig {
    pub fn with_temperature(&self, temperature: Option<f64>) -> Self {
        Self { temperature, ..self.clone() }
    }

    pub fn with_top_p(&self, top_p: Option<f64>) -> Self {
        Self { top_p, ..self.clone() }
    }

    pub fn with_reasoning_effort(&self, effort: Option<String>) -> Self {
        Self { reasoning_effort: effort, ..self.clone() }
    }

    pub fn with_thinking_budget(&self, budget: Option<u32>) -> Self {
        Self { thinking_budget: budget, ..self.clone() }
    }
}

/// How tool-call loop detection reacts when the repeat threshold is hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolLoopMode {
    #[default]
    Break,
    ChanceThenBreak,
}

impl ToolLoopMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "break" => Some(Self::Break),
            "chance_then_break" => Some(Self::ChanceThenBreak),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Loop-detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_true")]
    pub loop_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub tool_loop_detection_enabled: bool,
    #[serde(default)]
    pub tool_loop_max_repeats: Option<u32>,
    #[serde(default)]
    pub tool_loop_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub tool_loop_mode: ToolLoopMode,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loop_detection_enabled: true,
            tool_loop_detection_enabled: true,
            tool_loop_max_repeats: None,
            tool_loop_ttl_seconds: None,
            tool_loop_mode: ToolLoopMode::default(),
        }
    }
}

impl LoopConfig {
    pub fn with_loop_detection(&self, enabled: bool) -> Self {
        Self { loop_detection_enabled: enabled, ..self.clone() }
    }

    pub fn with_tool_loop_detection(&self, enabled: bool) -> Self {
        Self { tool_loop_detection_enabled: enabled, ..self.clone() }
    }

    pub fn with_tool_loop_max_repeats(&self, max_repeats: Option<u32>) -> Self {
        Self { tool_loop_max_repeats: max_repeats, ..self.clone() }
    }

    pub fn with_tool_loop_ttl_seconds(&self, ttl: Option<u64>) -> Self {
        Self { tool_loop_ttl_seconds: ttl, ..self.clone() }
    }

    pub fn with_tool_loop_mode(&self, mode: ToolLoopMode) -> Self {
        Self { tool_loop_mode: mode, ..self.clone() }
    }
}

/// Planning-phase routing: early turns of a session go to a stronger model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningPhaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strong_model: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_file_writes")]
    pub max_file_writes: u32,
}

fn default_max_turns() -> u32 {
    10
}

fn default_max_file_writes() -> u32 {
    1
}

impl Default for PlanningPhaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strong_model: None,
            max_turns: default_max_turns(),
            max_file_writes: default_max_file_writes(),
        }
    }
}

// ─── Session state ────────────────────────────────────────────────────────────

/// Immutable state of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub backend_config: BackendConfig,
    #[serde(default)]
    pub reasoning_config: ReasoningConfig,
    #[serde(default)]
    pub loop_config: LoopConfig,
    #[serde(default)]
    pub planning_phase_config: PlanningPhaseConfig,
    #[serde(default)]
    pub planning_phase_turn_count: u32,
    #[serde(default)]
    pub planning_phase_file_write_count: u32,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub project_dir: Option<String>,
    #[serde(default)]
    pub hello_requested: bool,
    #[serde(default)]
    pub interactive_just_enabled: bool,
    #[serde(default)]
    pub is_cline_agent: bool,
    #[serde(default)]
    pub compress_next_tool_call_reply: bool,
}

impl SessionState {
    pub fn with_backend_config(&self, backend_config: BackendConfig) -> Self {
        Self { backend_config, ..self.clone() }
    }

    pub fn with_reasoning_config(&self, reasoning_config: ReasoningConfig) -> Self {
        Self { reasoning_config, ..self.clone() }
    }

    pub fn with_loop_config(&self, loop_config: LoopConfig) -> Self {
        Self { loop_config, ..self.clone() }
    }

    pub fn with_planning_phase_config(&self, planning_phase_config: PlanningPhaseConfig) -> Self {
        Self { planning_phase_config, ..self.clone() }
    }

    pub fn with_planning_phase_turn_count(&self, count: u32) -> Self {
        Self { planning_phase_turn_count: count, ..self.clone() }
    }

    pub fn with_planning_phase_file_write_count(&self, count: u32) -> Self {
        Self { planning_phase_file_write_count: count, ..self.clone() }
    }

    pub fn with_project(&self, project: Option<String>) -> Self {
        Self { project, ..self.clone() }
    }

    pub fn with_project_dir(&self, project_dir: Option<String>) -> Self {
        Self { project_dir, ..self.clone() }
    }

    pub fn with_hello_requested(&self, hello_requested: bool) -> Self {
        Self { hello_requested, ..self.clone() }
    }

    pub fn with_interactive_just_enabled(&self, enabled: bool) -> Self {
        Self { interactive_just_enabled: enabled, ..self.clone() }
    }

    pub fn with_is_cline_agent(&self, is_cline_agent: bool) -> Self {
        Self { is_cline_agent, ..self.clone() }
    }

    pub fn with_compress_next_tool_call_reply(&self, compress: bool) -> Self {
        Self { compress_next_tool_call_reply: compress, ..self.clone() }
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// Represents one user prompt and the resulting response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInteraction {
    pub prompt: String,
    /// `"proxy"` when the turn was answered locally (command-only), or
    /// `"backend"` when it was forwarded upstream.
    pub handler: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl SessionInteraction {
    pub fn proxy(prompt: impl Into<String>) -> Self {
        Self::new(prompt, "proxy")
    }

    pub fn backend(prompt: impl Into<String>) -> Self {
        Self::new(prompt, "backend")
    }

    fn new(prompt: impl Into<String>, handler: &str) -> Self {
        Self {
            prompt: prompt.into(),
            handler: handler.to_string(),
            backend: None,
            model: None,
            project: None,
            parameters: serde_json::Map::new(),
            response: None,
            usage: None,
            timestamp: Utc::now(),
        }
    }
}

/// Container for conversation state and history, keyed by an opaque id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub history: Vec<SessionInteraction>,
    #[serde(default)]
    pub state: SessionState,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            last_active_at: now,
            agent: None,
            history: Vec::new(),
            state: SessionState::default(),
        }
    }

    /// Replace the state and bump the activity timestamp.
    pub fn update_state(&mut self, state: SessionState) {
        self.state = state;
        self.last_active_at = Utc::now();
    }

    /// Append an interaction, evicting the oldest entries past the cap.
    pub fn add_interaction(&mut self, interaction: SessionInteraction) {
        self.history.push(interaction);
        if self.history.len() > MAX_HISTORY_ENTRIES {
            let excess = self.history.len() - MAX_HISTORY_ENTRIES;
            self.history.drain(..excess);
        }
        self.last_active_at = Utc::now();
    }

    /// Record the calling agent.  Cline-family agents flip a state flag that
    /// the response path consults when shaping command results.
    pub fn set_agent(&mut self, agent: impl Into<String>) {
        let agent = agent.into();
        if matches!(agent.as_str(), "cline" | "roocode") && !self.state.is_cline_agent {
            self.state = self.state.with_is_cline_agent(true);
        }
        self.agent = Some(agent);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
