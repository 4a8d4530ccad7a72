// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `set` / `unset`: multi-key configuration commands.
//!
//! `set` dispatches each `key=value` pair to its sub-handler and folds the
//! resulting states left to right; `unset` takes positional keys and
//! silently ignores unknown ones.

use tracing::debug;

use prism_domain::{Session, SessionState};

use super::model::apply_model;
use crate::parser::Command;
use crate::registry::{CommandContext, CommandHandler, CommandResult};

pub struct SetHandler;

impl CommandHandler for SetHandler {
    fn name(&self) -> &'static str {
        "set"
    }

    fn description(&self) -> &'static str {
        "Set one or more session options"
    }

    fn usage(&self) -> String {
        "set(key1=value1, key2=value2, ...)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, ctx: &CommandContext) -> CommandResult {
        if cmd.args.is_empty() {
            return CommandResult::fail(self.name(), "No settings specified. Use set(key=value, ...)");
        }

        let mut state = session.state.clone();
        let mut messages = Vec::new();
        let mut success = true;

        for (key, value) in &cmd.args {
            match apply_set_key(key, value, &state, ctx) {
                Ok((new_state, message)) => {
                    state = new_state;
                    messages.push(message);
                }
                Err(message) => {
                    success = false;
                    messages.push(message);
                }
            }
        }

        let changed = state != session.state;
        CommandResult {
            name: self.name().to_string(),
            success,
            message: messages.join("; "),
            new_state: changed.then_some(state),
            data: None,
        }
    }
}

/// Apply one `key=value` setting.  Returns the new state and a result line,
/// or an error line when the key or value is invalid.
fn apply_set_key(
    key: &str,
    value: &str,
    state: &SessionState,
    ctx: &CommandContext,
) -> Result<(SessionState, String), String> {
    match key.to_lowercase().as_str() {
        "model" => apply_model(value, state, ctx),
        "backend" => {
            if value.is_empty() {
                return Err("Backend name must be specified".to_string());
            }
            if !ctx.is_registered(value) {
                return Err(format!("Backend {value} is not registered"));
            }
            let cfg = state.backend_config.with_backend(Some(value.to_string()));
            Ok((state.with_backend_config(cfg), format!("Backend changed to {value}")))
        }
        "openai-url" | "openai_url" => {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                return Err("URL must start with http:// or https://".to_string());
            }
            let cfg = state.backend_config.with_openai_url(Some(value.to_string()));
            Ok((state.with_backend_config(cfg), format!("OpenAI URL set to {value}")))
        }
        "temperature" => {
            let temperature: f64 = value
                .parse()
                .map_err(|_| "Temperature must be a valid number".to_string())?;
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
            let cfg = state.reasoning_config.with_temperature(Some(temperature));
            Ok((state.with_reasoning_config(cfg), format!("Temperature set to {temperature}")))
        }
        "top-p" | "top_p" => {
            let top_p: f64 = value.parse().map_err(|_| "top_p must be a valid number".to_string())?;
            if !(0.0..=1.0).contains(&top_p) {
                return Err("top_p must be between 0.0 and 1.0".to_string());
            }
            let cfg = state.reasoning_config.with_top_p(Some(top_p));
            Ok((state.with_reasoning_config(cfg), format!("top_p set to {top_p}")))
        }
        "reasoning-effort" | "reasoning_effort" => {
            let cfg = state.reasoning_config.with_reasoning_effort(Some(value.to_string()));
            Ok((state.with_reasoning_config(cfg), format!("Reasoning effort set to {value}")))
        }
        "thinking-budget" | "thinking_budget" => {
            let budget: u32 = value
                .parse()
                .map_err(|_| "Thinking budget must be a valid integer".to_string())?;
            let cfg = state.reasoning_config.with_thinking_budget(Some(budget));
            Ok((state.with_reasoning_config(cfg), format!("Thinking budget set to {budget}")))
        }
        "project" => Ok((
            state.with_project(Some(value.to_string())),
            format!("Project set to {value}"),
        )),
        "project-dir" | "project_dir" => Ok((
            state.with_project_dir(Some(value.to_string())),
            format!("Project directory set to {value}"),
        )),
        "interactive" | "interactive-mode" => {
            let enabled = super::parse_bool(value)
                .ok_or_else(|| format!("Invalid value for interactive: {value}"))?;
            let cfg = state.backend_config.with_interactive_mode(enabled);
            let state = state.with_backend_config(cfg);
            let state = if enabled { state.with_interactive_just_enabled(true) } else { state };
            Ok((
                state,
                if enabled { "Interactive mode enabled" } else { "Interactive mode disabled" }
                    .to_string(),
            ))
        }
        other => Err(format!("Unknown setting: {other}")),
    }
}

pub struct UnsetHandler;

impl CommandHandler for UnsetHandler {
    fn name(&self) -> &'static str {
        "unset"
    }

    fn description(&self) -> &'static str {
        "Unset previously configured options"
    }

    fn usage(&self) -> String {
        "unset(key1, key2, ...)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        if cmd.args.is_empty() {
            return CommandResult::fail(
                self.name(),
                "No parameters specified. Use unset(key1, key2, ...)",
            );
        }

        let mut state = session.state.clone();
        let mut messages = Vec::new();

        for key in cmd.keys() {
            match key.to_lowercase().as_str() {
                "model" => {
                    state = state.with_backend_config(state.backend_config.with_model(None));
                    messages.push("Model unset".to_string());
                }
                "backend" => {
                    state = state.with_backend_config(state.backend_config.with_backend(None));
                    messages.push("Backend unset".to_string());
                }
                "openai-url" | "openai_url" => {
                    state = state.with_backend_config(state.backend_config.with_openai_url(None));
                    messages.push("OpenAI URL unset".to_string());
                }
                "temperature" => {
                    state = state.with_reasoning_config(state.reasoning_config.with_temperature(None));
                    messages.push("Temperature unset".to_string());
                }
                "top-p" | "top_p" => {
                    state = state.with_reasoning_config(state.reasoning_config.with_top_p(None));
                    messages.push("top_p unset".to_string());
                }
                "reasoning-effort" | "reasoning_effort" => {
                    state = state
                        .with_reasoning_config(state.reasoning_config.with_reasoning_effort(None));
                    messages.push("Reasoning effort unset".to_string());
                }
                "thinking-budget" | "thinking_budget" => {
                    state = state
                        .with_reasoning_config(state.reasoning_config.with_thinking_budget(None));
                    messages.push("Thinking budget unset".to_string());
                }
                "project" => {
                    state = state.with_project(None);
                    messages.push("Project unset".to_string());
                }
                "project-dir" | "project_dir" => {
                    state = state.with_project_dir(None);
                    messages.push("Project directory unset".to_string());
                }
                "interactive" | "interactive-mode" => {
                    state = state
                        .with_backend_config(state.backend_config.with_interactive_mode(false));
                    messages.push("Interactive mode disabled".to_string());
                }
                "oneoff" | "one-off" => {
                    state = state.with_backend_config(state.backend_config.without_oneoff_route());
                    messages.push("One-off route cleared".to_string());
                }
                unknown => {
                    // Unknown keys are silently ignored.
                    debug!(key = unknown, "ignoring unknown unset parameter");
                }
            }
        }

        let changed = state != session.state;
        CommandResult {
            name: self.name().to_string(),
            success: true,
            message: messages.join("; "),
            new_state: changed.then_some(state),
            data: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
