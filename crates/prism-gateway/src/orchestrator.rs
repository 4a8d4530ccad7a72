// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The request-pipeline core.
//!
//! One turn: lock the session, apply in-band commands (serialized per
//! session), run the request middleware chain, release the lock, dispatch
//! with failover, then run the response middleware chain.  Command-only
//! turns are answered locally without touching any backend.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use prism_commands::process_messages;
use prism_domain::{
    parse_model_backend, BackendResponse, ByteStream, ChatRequest, LoopConfig, ProxyError,
    SessionInteraction,
};
use prism_pipeline::request::{route_attempts, RequestPipelineContext, FAILOVER_ATTEMPTS_KEY};
use prism_pipeline::response::sse::{format_event, make_text_chunk};
use prism_pipeline::response::ResponseContext;

use crate::state::AppState;

/// What one turn produced.
pub enum TurnOutcome {
    /// Answered by the proxy itself (command-only turn).
    Local(Value),
    /// A complete upstream response (already normalized to OpenAI shape).
    Unary(Value),
    /// A wrapped upstream SSE stream.
    Streaming(ByteStream),
}

impl std::fmt::Debug for TurnOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(v) => f.debug_tuple("Local").field(v).finish(),
            Self::Unary(v) => f.debug_tuple("Unary").field(v).finish(),
            Self::Streaming(_) => f.debug_tuple("Streaming").field(&"<stream>").finish(),
        }
    }
}

pub struct Orchestrator {
    state: Arc<AppState>,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one chat turn for `session_id`.
    pub async fn handle(
        &self,
        mut request: ChatRequest,
        session_id: &str,
        agent: Option<String>,
    ) -> Result<TurnOutcome, ProxyError> {
        if request.messages.is_empty() {
            return Err(ProxyError::invalid_request("messages must be non-empty"));
        }
        let app = &self.state;
        let prompt = request.last_user_text().unwrap_or_default();
        let default_backend = app.config.session.default_backend.clone();

        // ── Command phase (serialized per session) ───────────────────────────
        let (command_lines, command_only, loop_config) = {
            let mut session = app.sessions.lock_session(session_id).await;
            if let Some(agent) = agent {
                session.set_agent(agent);
            }

            let ctx = app.command_context();
            let processed = process_messages(
                &app.command_parser,
                &app.command_registry,
                &mut request.messages,
                &session,
                &ctx,
            );

            let mut lines: Vec<String> = Vec::new();
            for result in &processed.results {
                if let Some(new_state) = &result.new_state {
                    let state = new_state.clone();
                    session.update_state(state);
                }
                if !result.message.is_empty() {
                    lines.push(result.message.clone());
                }
            }

            // A turn whose content was nothing but the command is answered
            // locally.
            let command_only = processed.executed
                && !request.messages.iter().any(|m| {
                    !m.content.joined_text().trim().is_empty() || !m.tool_calls.is_empty()
                });

            // Session overrides and request middlewares run against the
            // post-command state, still under the session lock so the state
            // commit is atomic with the command mutations.
            if !command_only {
                apply_session_override(&mut request, &session.state);
                let mut pipeline_ctx =
                    RequestPipelineContext::new(session_id, session.state.clone());
                request = app.request_pipeline.process(request, &mut pipeline_ctx);
                if pipeline_ctx.state_changed {
                    session.update_state(pipeline_ctx.state.clone());
                }
            }

            if processed.executed {
                session.add_interaction(SessionInteraction::proxy(prompt.clone()));
            }

            (lines, command_only, session.state.loop_config.clone())
        };

        if command_only {
            let text = if command_lines.is_empty() {
                "OK".to_string()
            } else {
                command_lines.join("\n")
            };
            debug!(session_id, "turn answered locally by command processor");
            return Ok(TurnOutcome::Local(prism_translate::openai::local_text_response(
                &request.model,
                &text,
            )));
        }

        // ── Dispatch with failover ────────────────────────────────────────────
        let attempts = route_attempts(&request);
        request.extra_body.remove(FAILOVER_ATTEMPTS_KEY);

        let mut last_error: Option<ProxyError> = None;
        for (index, attempt) in attempts.iter().enumerate() {
            let (backend_name, effective_model) = resolve_target(attempt, &default_backend);
            let Some(connector) = app.connectors.get(&backend_name) else {
                last_error = Some(ProxyError::invalid_request(format!(
                    "unknown backend: {backend_name}"
                )));
                continue;
            };

            info!(
                session_id,
                backend = %backend_name,
                model = %effective_model,
                attempt = index + 1,
                attempts = attempts.len(),
                stream = request.stream,
                "dispatching upstream"
            );

            let identity = app.config.identity.as_ref();
            match connector
                .chat_completions(&request, &effective_model, identity)
                .await
            {
                Ok(response) => {
                    return self
                        .finish_turn(
                            response,
                            session_id,
                            &backend_name,
                            &effective_model,
                            &prompt,
                            command_lines,
                            loop_config,
                        )
                        .await;
                }
                Err(err) if err.is_retryable() && index + 1 < attempts.len() => {
                    warn!(
                        session_id,
                        backend = %backend_name,
                        error = %err,
                        "attempt failed; trying next route element"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| ProxyError::backend("no dispatch attempts made")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_turn(
        &self,
        response: BackendResponse,
        session_id: &str,
        backend_name: &str,
        effective_model: &str,
        prompt: &str,
        command_lines: Vec<String>,
        loop_config: LoopConfig,
    ) -> Result<TurnOutcome, ProxyError> {
        let app = &self.state;
        let mut ctx = ResponseContext::new(session_id, backend_name, effective_model);
        ctx.loop_config = loop_config;

        match response {
            BackendResponse::Unary(envelope) => {
                let mut content = app.response_pipeline.process_unary(envelope.content, &ctx).await;
                if !command_lines.is_empty() {
                    prepend_command_results(&mut content, &command_lines);
                }

                // Record the interaction outside the hot path details.
                let usage = content.get("usage").cloned();
                let response_text = content["choices"][0]["message"]["content"]
                    .as_str()
                    .map(String::from);
                {
                    let mut session = app.sessions.lock_session(session_id).await;
                    let mut interaction = SessionInteraction::backend(prompt);
                    interaction.backend = Some(backend_name.to_string());
                    interaction.model = Some(effective_model.to_string());
                    interaction.project = session.state.project.clone();
                    interaction.response = response_text;
                    interaction.usage = usage;
                    session.add_interaction(interaction);
                }
                Ok(TurnOutcome::Unary(content))
            }
            BackendResponse::Streaming(envelope) => {
                let wrapped = app.response_pipeline.wrap_stream(envelope.content, &ctx);
                let stream = if command_lines.is_empty() {
                    wrapped
                } else {
                    // Command results lead the stream as a synthetic delta.
                    let first = make_text_chunk(
                        effective_model,
                        &format!("{}\n", command_lines.join("\n")),
                        None,
                    );
                    let head = futures::stream::once(async move { Ok(format_event(&first)) });
                    Box::pin(head.chain(wrapped)) as ByteStream
                };
                {
                    let mut session = app.sessions.lock_session(session_id).await;
                    let mut interaction = SessionInteraction::backend(prompt);
                    interaction.backend = Some(backend_name.to_string());
                    interaction.model = Some(effective_model.to_string());
                    session.add_interaction(interaction);
                }
                Ok(TurnOutcome::Streaming(stream))
            }
        }
    }
}

/// Rewrite the request model per the session overrides.
///
/// A session-level model override replaces even a caller-qualified model;
/// a backend override re-homes whatever model remains.  Route specs are
/// left alone — the failover middleware owns them — and the one-off
/// middleware runs later, so a pending one-off still wins.
fn apply_session_override(request: &mut ChatRequest, state: &prism_domain::SessionState) {
    if request.model.starts_with("route:") {
        return;
    }
    let backend_config = &state.backend_config;
    if backend_config.model.is_none() && backend_config.backend_type.is_none() {
        return;
    }
    let (request_backend, request_model) = match parse_model_backend(&request.model) {
        Some((backend, model)) => (Some(backend), model),
        None => (None, request.model.clone()),
    };
    let backend = backend_config.backend_type.clone().or(request_backend);
    let model = backend_config.model.clone().unwrap_or(request_model);
    request.model = match backend {
        Some(backend) => format!("{backend}:{model}"),
        None => model,
    };
}

/// Resolve one dispatch attempt to `(backend, model)`.  Unqualified specs
/// fall back to the configured default backend.
fn resolve_target(spec: &str, default_backend: &str) -> (String, String) {
    match parse_model_backend(spec) {
        Some((backend, model)) => (backend, model),
        None => (default_backend.to_string(), spec.to_string()),
    }
}

/// Prefix the assistant content with the command-result lines, so callers
/// see both the command outcome and the model reply.
fn prepend_command_results(content: &mut Value, lines: &[String]) {
    let joined = lines.join("\n");
    let message = &mut content["choices"][0]["message"];
    match message["content"].as_str() {
        Some(existing) if !existing.is_empty() => {
            message["content"] = Value::String(format!("{joined}\n{existing}"));
        }
        _ => {
            message["content"] = Value::String(joined);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
