// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Axum ingress.
//!
//! Thin adapters per wire format: parse at the edge, hand the canonical
//! request to the orchestrator, and render the outcome back in the
//! caller's schema.  Domain errors map to HTTP statuses here and nowhere
//! else.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use prism_domain::{ByteStream, ProxyError};
use prism_translate::{anthropic, gemini, openai};

use crate::orchestrator::{Orchestrator, TurnOutcome};
use crate::state::AppState;

struct Shared {
    state: Arc<AppState>,
    orchestrator: Orchestrator,
}

/// Build the ingress router.
pub fn router(state: Arc<AppState>) -> Router {
    let orchestrator = Orchestrator::new(Arc::clone(&state));
    let shared = Arc::new(Shared { state, orchestrator });
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/:model_action", post(gemini_generate))
        .route("/v1/responses", post(responses_api))
        .route("/v1/models", get(list_models))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(32 * 1024 * 1024))
        .with_state(shared)
}

/// Bind and serve until shutdown.
pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "prism listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ─── Session id and auth ──────────────────────────────────────────────────────

/// Body `session_id` → `X-Session-Id` header → `session_id` cookie →
/// freshly generated.
fn resolve_session_id(body: &Value, headers: &HeaderMap) -> String {
    if let Some(id) = body["session_id"].as_str().filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return id.to_string();
    }
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "session_id" && !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    Uuid::new_v4().to_string()
}

fn calling_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.to_lowercase())
        .and_then(|ua| {
            ["cline", "roocode", "aider"]
                .iter()
                .find(|agent| ua.contains(*agent))
                .map(|agent| agent.to_string())
        })
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    if state.config.session.disable_auth {
        return Ok(());
    }
    let Some(expected) = state.config.server.api_key.as_deref() else {
        return Ok(());
    };
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match supplied {
        Some(key) if key == expected => Ok(()),
        _ => Err(ProxyError::authentication("missing or invalid API key")),
    }
}

// ─── Error rendering ──────────────────────────────────────────────────────────

fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": match err {
                ProxyError::InvalidRequest { .. } => "invalid_request_error",
                ProxyError::Authentication(_) => "authentication_error",
                ProxyError::Backend { .. } => "backend_error",
                ProxyError::ServiceUnavailable(_) => "service_unavailable",
                ProxyError::ToolCallReactor(_) => "internal_error",
            },
        }
    });
    (status, Json(body)).into_response()
}

fn sse_response(stream: ByteStream) -> Response {
    let body = Body::from_stream(stream.map(|frame| {
        frame.map_err(|e| std::io::Error::other(e.to_string()))
    }));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn chat_completions(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(e) = check_auth(&shared.state, &headers) {
        return error_response(&e);
    }
    let session_id = resolve_session_id(&body, &headers);
    let request = match openai::request_from_wire(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match shared
        .orchestrator
        .handle(request, &session_id, calling_agent(&headers))
        .await
    {
        Ok(TurnOutcome::Local(content)) | Ok(TurnOutcome::Unary(content)) => {
            Json(content).into_response()
        }
        Ok(TurnOutcome::Streaming(stream)) => sse_response(stream),
        Err(e) => error_response(&e),
    }
}

async fn anthropic_messages(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(e) = check_auth(&shared.state, &headers) {
        return error_response(&e);
    }
    let session_id = resolve_session_id(&body, &headers);
    let request = match anthropic::request_from_wire(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    let streaming = request.stream;
    match shared
        .orchestrator
        .handle(request, &session_id, calling_agent(&headers))
        .await
    {
        Ok(TurnOutcome::Local(content)) | Ok(TurnOutcome::Unary(content)) => {
            Json(anthropic::response_from_openai(&content)).into_response()
        }
        Ok(TurnOutcome::Streaming(stream)) if streaming => {
            sse_response(anthropic_event_stream(stream))
        }
        Ok(TurnOutcome::Streaming(stream)) => sse_response(stream),
        Err(e) => error_response(&e),
    }
}

/// Convert the internal OpenAI-chunk SSE stream to Anthropic events:
/// `message_start`, `content_block_delta` per text delta, `message_stop`.
fn anthropic_event_stream(stream: ByteStream) -> ByteStream {
    use prism_pipeline::response::sse::{parse_data_line, SseEvent, SseLineBuffer};

    let header = futures::stream::once(async {
        Ok(bytes::Bytes::from(format!(
            "event: message_start\ndata: {}\n\n",
            json!({"type": "message_start", "message": {"role": "assistant", "content": []}})
        )))
    });
    let body = stream
        .scan(SseLineBuffer::default(), |buffer, frame| {
            let out: Vec<Result<bytes::Bytes, ProxyError>> = match frame {
                Ok(chunk) => buffer
                    .push_and_drain(&chunk)
                    .into_iter()
                    .filter_map(|line| match parse_data_line(&line) {
                        Some(SseEvent::Done) => Some(Ok(bytes::Bytes::from(format!(
                            "event: message_stop\ndata: {}\n\n",
                            json!({"type": "message_stop"})
                        )))),
                        Some(SseEvent::Json(v)) => {
                            let text = v["choices"][0]["delta"]["content"].as_str()?;
                            if text.is_empty() {
                                return None;
                            }
                            let event = json!({
                                "type": "content_block_delta",
                                "index": 0,
                                "delta": {"type": "text_delta", "text": text},
                            });
                            Some(Ok(bytes::Bytes::from(format!(
                                "event: content_block_delta\ndata: {event}\n\n"
                            ))))
                        }
                        None => None,
                    })
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            std::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter);
    Box::pin(header.chain(body))
}

async fn gemini_generate(
    State(shared): State<Arc<Shared>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(e) = check_auth(&shared.state, &headers) {
        return error_response(&e);
    }
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return error_response(&ProxyError::invalid_request(
            "expected /v1beta/models/{model}:generateContent",
        ));
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return error_response(&ProxyError::invalid_request(format!(
                "unknown action: {other}"
            )))
        }
    };

    let session_id = resolve_session_id(&body, &headers);
    let request = match gemini::request_from_wire(&body, model, stream) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match shared
        .orchestrator
        .handle(request, &session_id, calling_agent(&headers))
        .await
    {
        Ok(TurnOutcome::Local(content)) | Ok(TurnOutcome::Unary(content)) => {
            Json(gemini::response_from_openai(&content)).into_response()
        }
        Ok(TurnOutcome::Streaming(stream)) => sse_response(gemini_event_stream(stream)),
        Err(e) => error_response(&e),
    }
}

/// Convert the internal OpenAI-chunk SSE stream back to Gemini chunks.
fn gemini_event_stream(stream: ByteStream) -> ByteStream {
    use prism_pipeline::response::sse::{parse_data_line, SseEvent, SseLineBuffer};

    Box::pin(
        stream
            .scan(SseLineBuffer::default(), |buffer, frame| {
                let out: Vec<Result<bytes::Bytes, ProxyError>> = match frame {
                    Ok(chunk) => buffer
                        .push_and_drain(&chunk)
                        .into_iter()
                        .filter_map(|line| match parse_data_line(&line) {
                            Some(SseEvent::Done) => None,
                            Some(SseEvent::Json(v)) => {
                                let converted = gemini::stream_chunk_from_openai(&v);
                                Some(Ok(bytes::Bytes::from(format!("data: {converted}\n\n"))))
                            }
                            None => None,
                        })
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                std::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter),
    )
}

/// OpenAI Responses API: alternate endpoint, same canonical pipeline.
async fn responses_api(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(e) = check_auth(&shared.state, &headers) {
        return error_response(&e);
    }
    let session_id = resolve_session_id(&body, &headers);

    // The Responses API carries `input` as a string or message list.
    let mut chat_body = body.clone();
    if let Some(input) = body.get("input") {
        let messages = match input {
            Value::String(text) => json!([{"role": "user", "content": text}]),
            other => other.clone(),
        };
        chat_body["messages"] = messages;
    }
    let request = match openai::request_from_wire(&chat_body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    match shared
        .orchestrator
        .handle(request, &session_id, calling_agent(&headers))
        .await
    {
        Ok(TurnOutcome::Local(content)) | Ok(TurnOutcome::Unary(content)) => {
            let text = content["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default();
            Json(json!({
                "id": content["id"],
                "object": "response",
                "model": content["model"],
                "output": [{
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": text}],
                }],
                "usage": content["usage"],
            }))
            .into_response()
        }
        Ok(TurnOutcome::Streaming(stream)) => sse_response(stream),
        Err(e) => error_response(&e),
    }
}

async fn list_models(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&shared.state, &headers) {
        return error_response(&e);
    }
    let data: Vec<Value> = shared
        .state
        .connectors
        .aggregate_models()
        .into_iter()
        .map(|id| {
            let owner = id.split(':').next().unwrap_or_default().to_string();
            json!({"id": id, "object": "model", "owned_by": owner})
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
