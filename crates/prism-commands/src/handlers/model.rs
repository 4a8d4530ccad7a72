// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Backend / model selection commands.

use prism_domain::{parse_model_backend, Session, SessionState};

use super::single_arg;
use crate::parser::Command;
use crate::registry::{CommandContext, CommandHandler, CommandResult};

/// Shared by `model(...)` and `set(model=...)`.
///
/// An empty name clears the model.  A `backend:model` or `backend/model`
/// spec sets both halves, provided the backend is registered.
pub(crate) fn apply_model(
    value: &str,
    state: &SessionState,
    ctx: &CommandContext,
) -> Result<(SessionState, String), String> {
    if value.is_empty() {
        let backend_config = state.backend_config.with_model(None);
        return Ok((state.with_backend_config(backend_config), "Model unset".to_string()));
    }
    if let Some((backend, model)) = parse_model_backend(value) {
        if !ctx.is_registered(&backend) {
            return Err(format!("Backend {backend} is not registered"));
        }
        let backend_config = state.backend_config.with_backend_and_model(&backend, &model);
        return Ok((
            state.with_backend_config(backend_config),
            format!("Model changed to {model}"),
        ));
    }
    let backend_config = state.backend_config.with_model(Some(value.to_string()));
    Ok((
        state.with_backend_config(backend_config),
        format!("Model changed to {value}"),
    ))
}

pub struct ModelHandler;

impl CommandHandler for ModelHandler {
    fn name(&self) -> &'static str {
        "model"
    }

    fn description(&self) -> &'static str {
        "Change the active model for LLM requests"
    }

    fn usage(&self) -> String {
        "model(name=model-name)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, ctx: &CommandContext) -> CommandResult {
        // `model()` with no argument at all clears the model; `model(name=)`
        // does too, because the empty value falls through single_arg.
        let value = single_arg(cmd, &["name"]).unwrap_or("");
        match apply_model(value, &session.state, ctx) {
            Ok((state, message)) => CommandResult::ok_with_state(self.name(), message, state),
            Err(message) => CommandResult::fail(self.name(), message),
        }
    }
}

pub struct BackendHandler;

impl CommandHandler for BackendHandler {
    fn name(&self) -> &'static str {
        "backend"
    }

    fn description(&self) -> &'static str {
        "Change the active backend for LLM requests"
    }

    fn usage(&self) -> String {
        "backend(name=openrouter|gemini|anthropic|openai|...)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, ctx: &CommandContext) -> CommandResult {
        let Some(name) = single_arg(cmd, &["name"]) else {
            return CommandResult::fail(self.name(), "Backend name must be specified");
        };
        if ctx.is_functional(name) {
            let backend_config = session.state.backend_config.with_backend(Some(name.to_string()));
            let state = session.state.with_backend_config(backend_config);
            return CommandResult::ok_with_state(
                self.name(),
                format!("Backend changed to {name}"),
                state,
            );
        }
        // Unknown or non-functional backend: clear the override and warn, but
        // report success so agents do not retry the command in a loop.
        let backend_config = session.state.backend_config.without_override();
        let state = session.state.with_backend_config(backend_config);
        CommandResult::ok_with_state(
            self.name(),
            format!("Backend {name} is not functional; backend override cleared"),
            state,
        )
    }
}

pub struct OpenAiUrlHandler;

impl CommandHandler for OpenAiUrlHandler {
    fn name(&self) -> &'static str {
        "openai-url"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["openai_url"]
    }

    fn description(&self) -> &'static str {
        "Override the OpenAI-compatible API base URL"
    }

    fn usage(&self) -> String {
        "openai-url(url=https://host/v1)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(url) = single_arg(cmd, &["url", "name"]) else {
            return CommandResult::fail(self.name(), "URL must be specified");
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return CommandResult::fail(self.name(), "URL must start with http:// or https://");
        }
        let backend_config = session.state.backend_config.with_openai_url(Some(url.to_string()));
        let state = session.state.with_backend_config(backend_config);
        CommandResult::ok_with_state(self.name(), format!("OpenAI URL set to {url}"), state)
    }
}

pub struct TemperatureHandler;

impl CommandHandler for TemperatureHandler {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn description(&self) -> &'static str {
        "Change the temperature setting for LLM requests"
    }

    fn usage(&self) -> String {
        "temperature(value=0.0-1.0)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(value) = single_arg(cmd, &["value"]) else {
            return CommandResult::fail(self.name(), "Temperature value must be specified");
        };
        let Ok(temperature) = value.parse::<f64>() else {
            return CommandResult::fail(self.name(), "Temperature must be a valid number");
        };
        if !(0.0..=1.0).contains(&temperature) {
            return CommandResult::fail(self.name(), "Temperature must be between 0.0 and 1.0");
        }
        let reasoning = session.state.reasoning_config.with_temperature(Some(temperature));
        let state = session.state.with_reasoning_config(reasoning);
        CommandResult::ok_with_state(self.name(), format!("Temperature set to {temperature}"), state)
    }
}

pub struct OneoffHandler;

impl CommandHandler for OneoffHandler {
    fn name(&self) -> &'static str {
        "oneoff"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["one-off"]
    }

    fn description(&self) -> &'static str {
        "Sets a one-time override for the backend and model for the next request."
    }

    fn usage(&self) -> String {
        "oneoff(backend/model)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        if cmd.args.is_empty() {
            return CommandResult::fail(
                self.name(),
                "oneoff command requires a backend/model argument.",
            );
        }
        let Some(spec) = extract_route_argument(cmd) else {
            return CommandResult::fail(
                self.name(),
                "Invalid format. Use backend/model or backend:model.",
            );
        };
        let Some((backend, model)) = parse_model_backend(&spec) else {
            return CommandResult::fail(
                self.name(),
                "Invalid format. Use backend/model or backend:model.",
            );
        };
        let backend_config = session.state.backend_config.with_oneoff_route(&backend, &model);
        let state = session.state.with_backend_config(backend_config);
        CommandResult::ok_with_state(
            self.name(),
            format!("One-off route set to {backend}/{model}."),
            state,
        )
    }
}

/// Pull the `backend/model` argument out of the parsed args: named keys
/// first, then any key or value that carries a separator.
fn extract_route_argument(cmd: &Command) -> Option<String> {
    for key in ["element", "value", "route", "target", "name"] {
        if let Some(v) = cmd.get(key) {
            if !v.trim().is_empty() {
                return Some(v.trim().to_string());
            }
        }
    }
    for (key, value) in &cmd.args {
        let key = key.trim();
        if !key.is_empty() && (key.contains('/') || key.contains(':')) {
            return Some(key.to_string());
        }
        let value = value.trim();
        if !value.is_empty() && (value.contains('/') || value.contains(':')) {
            return Some(value.to_string());
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
