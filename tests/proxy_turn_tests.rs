// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Full-pipeline turn tests against stub connectors: command language,
//! policy enforcement, failover, and streaming framing, end to end.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use prism_config::{Config, IdentityConfig};
use prism_connectors::{Connector, ConnectorRegistry};
use prism_domain::{
    BackendResponse, ByteStream, ChatMessage, ChatRequest, ProxyError, ResponseEnvelope,
    StreamingResponseEnvelope,
};
use prism_gateway::{AppState, Orchestrator, TurnOutcome};

/// Stub backend returning canned unary or streaming responses.
struct StubBackend {
    name: &'static str,
    unary: Mutex<Vec<Result<Value, ProxyError>>>,
    sse: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl StubBackend {
    fn unary(name: &'static str, results: Vec<Result<Value, ProxyError>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            unary: Mutex::new(results),
            sse: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn streaming(name: &'static str, sse: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            name,
            unary: Mutex::new(Vec::new()),
            sse: Mutex::new(sse),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Connector for StubBackend {
    fn name(&self) -> &str {
        self.name
    }
    async fn initialize(&self) -> Result<(), ProxyError> {
        Ok(())
    }
    fn get_available_models(&self) -> Vec<String> {
        vec!["stub-model".into()]
    }
    async fn get_available_models_async(&self) -> Result<Vec<String>, ProxyError> {
        Ok(self.get_available_models())
    }
    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        _identity: Option<&IdentityConfig>,
    ) -> Result<BackendResponse, ProxyError> {
        self.calls.lock().unwrap().push(effective_model.to_string());
        if request.stream {
            let frames: Vec<Result<bytes::Bytes, ProxyError>> = self
                .sse
                .lock()
                .unwrap()
                .iter()
                .map(|f| Ok(bytes::Bytes::from(f.clone())))
                .collect();
            let stream: ByteStream = Box::pin(futures::stream::iter(frames));
            return Ok(BackendResponse::Streaming(StreamingResponseEnvelope::new(stream)));
        }
        let mut results = self.unary.lock().unwrap();
        let next = if results.is_empty() {
            Ok(assistant_reply("stub reply"))
        } else {
            results.remove(0)
        };
        next.map(|content| BackendResponse::Unary(ResponseEnvelope::new(content)))
    }
}

fn assistant_reply(text: &str) -> Value {
    json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "model": "stub-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
    })
}

fn tool_call_reply(name: &str, arguments: &str) -> Value {
    json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "model": "stub-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": null, "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            }]},
            "finish_reason": "tool_calls",
        }],
    })
}

fn orchestrator(backends: Vec<Arc<StubBackend>>) -> Orchestrator {
    let mut registry = ConnectorRegistry::new();
    for backend in backends {
        registry.register(backend).unwrap();
    }
    Orchestrator::new(Arc::new(AppState::new(Config::default(), Arc::new(registry))))
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn model_switch_via_in_prompt_command() {
    let openai = StubBackend::unary("openai", vec![]);
    let openrouter = StubBackend::unary("openrouter", vec![Ok(assistant_reply("model reply"))]);
    let orchestrator = orchestrator(vec![openai, openrouter.clone()]);

    let request = ChatRequest::new(
        "openai:gpt-3.5-turbo",
        vec![ChatMessage::user("!/set(model=openrouter:gpt-4) hi")],
    );
    let outcome = orchestrator.handle(request, "scenario-1", None).await.unwrap();
    let TurnOutcome::Unary(content) = outcome else {
        panic!("expected unary outcome")
    };

    let text = content["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(text.contains("Model changed to gpt-4"));
    assert!(text.contains("model reply"));
    assert_eq!(openrouter.calls.lock().unwrap().as_slice(), ["gpt-4"]);
}

#[tokio::test]
async fn dangerous_command_is_blocked_with_steering_text() {
    let openai = StubBackend::unary(
        "openai",
        vec![Ok(tool_call_reply(
            "execute_command",
            "{\"command\":\"git reset --hard\"}",
        ))],
    );
    let orchestrator = orchestrator(vec![openai]);

    let request = ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("clean up my repo")]);
    let outcome = orchestrator.handle(request, "scenario-2", None).await.unwrap();
    let TurnOutcome::Unary(content) = outcome else {
        panic!("expected unary outcome")
    };

    let choice = &content["choices"][0];
    assert!(choice["message"]["content"]
        .as_str()
        .unwrap()
        .contains("security enforcement module"));
    assert!(choice["message"]["tool_calls"].is_null());
    assert_eq!(choice["finish_reason"], "stop");
}

#[tokio::test]
async fn failover_route_retries_in_declared_order() {
    let primary = StubBackend::unary(
        "openai",
        vec![Err(ProxyError::backend_with_status("upstream down", "e", 503))],
    );
    let secondary = StubBackend::unary("anthropic", vec![Ok(assistant_reply("from claude"))]);
    let orchestrator = orchestrator(vec![primary.clone(), secondary.clone()]);

    for command in [
        "!/create-failover-route(name=r, policy=k)",
        "!/route-append(name=r, element=openai:gpt-4)",
        "!/route-append(name=r, element=anthropic:claude-3-opus)",
    ] {
        orchestrator
            .handle(
                ChatRequest::new("openai:gpt-4", vec![ChatMessage::user(command)]),
                "scenario-4",
                None,
            )
            .await
            .unwrap();
    }

    let outcome = orchestrator
        .handle(
            ChatRequest::new("route:r", vec![ChatMessage::user("question")]),
            "scenario-4",
            None,
        )
        .await
        .unwrap();
    let TurnOutcome::Unary(content) = outcome else {
        panic!("expected unary outcome")
    };
    assert_eq!(content["choices"][0]["message"]["content"], "from claude");
    assert_eq!(primary.calls.lock().unwrap().as_slice(), ["gpt-4"]);
    assert_eq!(secondary.calls.lock().unwrap().as_slice(), ["claude-3-opus"]);
}

#[tokio::test]
async fn streaming_turn_keeps_sse_framing_and_done_sentinel() {
    let backend = StubBackend::streaming(
        "openai",
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n".into(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n".into(),
            "data: [DONE]\n\n".into(),
        ],
    );
    let orchestrator = orchestrator(vec![backend]);

    let mut request = ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("hi")]);
    request.stream = true;
    let outcome = orchestrator.handle(request, "scenario-stream", None).await.unwrap();
    let TurnOutcome::Streaming(stream) = outcome else {
        panic!("expected streaming outcome")
    };
    let frames: Vec<_> = stream.collect().await;
    let text: String = frames
        .into_iter()
        .map(|f| String::from_utf8_lossy(&f.unwrap()).to_string())
        .collect();
    assert!(text.contains("\"content\":\"hel\""));
    assert!(text.contains("\"content\":\"lo\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn pytest_full_suite_is_steered_once_then_allowed() {
    let backend = StubBackend::unary(
        "openai",
        vec![
            Ok(tool_call_reply("execute_command", "{\"command\":\"pytest\"}")),
            Ok(tool_call_reply("execute_command", "{\"command\":\"pytest\"}")),
        ],
    );
    let orchestrator = orchestrator(vec![backend]);

    // First full-suite attempt: swallowed with the steering message.
    let outcome = orchestrator
        .handle(
            ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("run tests")]),
            "scenario-pytest",
            None,
        )
        .await
        .unwrap();
    let TurnOutcome::Unary(first) = outcome else {
        panic!("expected unary outcome")
    };
    assert!(first["choices"][0]["message"]["content"]
        .as_str()
        .unwrap()
        .contains("whole test suite"));

    // Identical re-issue: passes through untouched.
    let outcome = orchestrator
        .handle(
            ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("run tests again")]),
            "scenario-pytest",
            None,
        )
        .await
        .unwrap();
    let TurnOutcome::Unary(second) = outcome else {
        panic!("expected unary outcome")
    };
    assert_eq!(
        second["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "execute_command"
    );
}

#[tokio::test]
async fn pwd_command_round_trip() {
    let orchestrator = orchestrator(vec![StubBackend::unary("openai", vec![])]);
    // Unset: failure message is still returned inline.
    let outcome = orchestrator
        .handle(
            ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("!/pwd")]),
            "scenario-pwd",
            None,
        )
        .await
        .unwrap();
    let TurnOutcome::Local(content) = outcome else {
        panic!("expected local outcome")
    };
    assert_eq!(
        content["choices"][0]["message"]["content"],
        "Project directory not set."
    );

    // After setting the directory, pwd echoes it.
    orchestrator
        .handle(
            ChatRequest::new(
                "openai:gpt-4",
                vec![ChatMessage::user("!/set(project-dir=/work/acme)")],
            ),
            "scenario-pwd",
            None,
        )
        .await
        .unwrap();
    let outcome = orchestrator
        .handle(
            ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("!/pwd")]),
            "scenario-pwd",
            None,
        )
        .await
        .unwrap();
    let TurnOutcome::Local(content) = outcome else {
        panic!("expected local outcome")
    };
    assert_eq!(content["choices"][0]["message"]["content"], "/work/acme");
}
