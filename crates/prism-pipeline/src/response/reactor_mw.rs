// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call reactor middleware.
//!
//! Detects tool calls in upstream responses and runs them through the
//! reactor.  A swallowed call is removed from the assistant message and
//! replaced by the handler's steering text; other tool calls in the same
//! message are preserved.
//!
//! For streaming responses, tool-call delta chunks are withheld while text
//! deltas keep flowing; once the stream finishes the assembled calls are
//! dispatched, and the withheld chunks are either flushed (pass) or
//! replaced by a steering chunk (swallow).

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use prism_domain::{ByteStream, ProxyError};

use super::sse::{
    chunk_has_tool_calls, done_frame, format_event, make_text_chunk, parse_data_line,
    SseEvent, SseLineBuffer, ToolCallAssembler,
};
use super::{ResponseContext, ResponseMiddleware};
use crate::reactor::{ToolCallContext, ToolCallReactor};
use crate::repair::repair_json;

/// One detected tool call, with its position in the response.
#[derive(Debug, Clone)]
pub(crate) struct DetectedToolCall {
    pub choice_index: usize,
    pub call_index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Find tool calls in an OpenAI-shape response: `choices[*].message.
/// tool_calls` first, falling back to a content list of the same shape.
pub(crate) fn extract_tool_calls(response: &Value) -> Vec<DetectedToolCall> {
    let mut out = Vec::new();
    let Some(choices) = response["choices"].as_array() else {
        return out;
    };
    for (choice_index, choice) in choices.iter().enumerate() {
        let message = &choice["message"];
        let from_field = message["tool_calls"].as_array();
        let from_content = message["content"].as_array().filter(|entries| {
            entries
                .iter()
                .all(|e| e["function"]["name"].is_string())
        });
        let Some(calls) = from_field.or(from_content) else {
            continue;
        };
        for (call_index, call) in calls.iter().enumerate() {
            let Some(name) = call["function"]["name"].as_str() else {
                continue;
            };
            out.push(DetectedToolCall {
                choice_index,
                call_index,
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: name.to_string(),
                arguments: call["function"]["arguments"]
                    .as_str()
                    .unwrap_or("{}")
                    .to_string(),
            });
        }
    }
    out
}

/// Parse tool arguments: plain JSON first, then repaired JSON, then the
/// raw string as-is.
pub(crate) fn parse_arguments(arguments: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(arguments) {
        return v;
    }
    if let Ok(repaired) = repair_json(arguments) {
        if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
            return v;
        }
    }
    Value::String(arguments.to_string())
}

pub struct ToolCallReactorMiddleware {
    reactor: Arc<ToolCallReactor>,
}

impl ToolCallReactorMiddleware {
    pub fn new(reactor: Arc<ToolCallReactor>) -> Self {
        Self { reactor }
    }

    fn make_context(
        &self,
        ctx: &ResponseContext,
        response: &Value,
        call: &DetectedToolCall,
    ) -> ToolCallContext {
        ToolCallContext {
            session_id: ctx.session_id.clone(),
            backend_name: ctx.backend_name.clone(),
            model_name: ctx.model_name.clone(),
            full_response: response.clone(),
            tool_name: call.name.clone(),
            tool_arguments: parse_arguments(&call.arguments),
            calling_agent: ctx.calling_agent.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Rewrite `response` after `swallowed` was intercepted: the assistant
/// content becomes the steering text, the swallowed call is dropped, and
/// `finish_reason` falls back to `stop` when no calls remain.
fn apply_swallow(response: &mut Value, swallowed: &DetectedToolCall, replacement: &str) {
    let choice = &mut response["choices"][swallowed.choice_index];
    choice["message"]["content"] = json!(replacement);
    let remaining: Vec<Value> = choice["message"]["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != swallowed.call_index)
                .map(|(_, c)| c.clone())
                .collect()
        })
        .unwrap_or_default();
    if remaining.is_empty() {
        if let Some(obj) = choice["message"].as_object_mut() {
            obj.remove("tool_calls");
        }
        choice["finish_reason"] = json!("stop");
    } else {
        choice["message"]["tool_calls"] = json!(remaining);
    }
}

#[async_trait::async_trait]
impl ResponseMiddleware for ToolCallReactorMiddleware {
    fn name(&self) -> &'static str {
        "tool_call_reactor"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn process_unary(&self, mut response: Value, ctx: &ResponseContext) -> Value {
        let calls = extract_tool_calls(&response);
        if calls.is_empty() {
            return response;
        }
        debug!(
            session_id = %ctx.session_id,
            count = calls.len(),
            "detected tool calls in response"
        );
        // Left-to-right across calls; the first swallow rewrites the
        // response and ends processing.
        for call in &calls {
            let tc_ctx = self.make_context(ctx, &response, call);
            if let Some(reaction) = self.reactor.process_tool_call(&tc_ctx).await {
                if reaction.should_swallow {
                    let replacement = reaction
                        .replacement_response
                        .unwrap_or_else(|| "Tool call intercepted by the proxy.".to_string());
                    apply_swallow(&mut response, call, &replacement);
                    break;
                }
            }
        }
        response
    }

    fn wrap_stream(&self, stream: ByteStream, ctx: &ResponseContext) -> ByteStream {
        let reactor = Arc::clone(&self.reactor);
        let ctx = ctx.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, ProxyError>>(16);

        tokio::spawn(async move {
            let mut upstream = stream;
            let mut lines = SseLineBuffer::default();
            let mut assembler = ToolCallAssembler::default();
            let mut held: Vec<String> = Vec::new();
            let mut decided = false;

            'outer: while let Some(frame) = upstream.next().await {
                let bytes = match frame {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for line in lines.push_and_drain(&bytes) {
                    match parse_data_line(&line) {
                        Some(SseEvent::Done) => {
                            decided = true;
                            let swallowed = dispatch_assembled(
                                &reactor, &ctx, &assembler,
                            )
                            .await;
                            match swallowed {
                                Some(replacement) => {
                                    let chunk = make_text_chunk(
                                        &ctx.model_name,
                                        &replacement,
                                        Some("stop"),
                                    );
                                    let _ = tx.send(Ok(format_event(&chunk))).await;
                                    let _ = tx.send(Ok(done_frame())).await;
                                    // Drop held tool-call chunks and close upstream.
                                    break 'outer;
                                }
                                None => {
                                    for held_line in held.drain(..) {
                                        if tx
                                            .send(Ok(Bytes::from(format!("{held_line}\n"))))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                    let _ = tx.send(Ok(done_frame())).await;
                                    // Nothing meaningful follows the sentinel.
                                    break 'outer;
                                }
                            }
                        }
                        Some(SseEvent::Json(chunk)) => {
                            let holding = !assembler.is_empty();
                            if chunk_has_tool_calls(&chunk) {
                                assembler.feed(&chunk);
                                held.push(line);
                            } else if holding {
                                // Keep ordering stable once calls started.
                                held.push(line);
                            } else if tx
                                .send(Ok(Bytes::from(format!("{line}\n"))))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        None => {
                            if tx.send(Ok(Bytes::from(format!("{line}\n")))).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            // Upstream ended without [DONE]: dispatch what was assembled and
            // flush the leftovers.
            if !decided {
                match dispatch_assembled(&reactor, &ctx, &assembler).await {
                    Some(replacement) => {
                        let chunk = make_text_chunk(&ctx.model_name, &replacement, Some("stop"));
                        let _ = tx.send(Ok(format_event(&chunk))).await;
                        let _ = tx.send(Ok(done_frame())).await;
                    }
                    None => {
                        for held_line in held.drain(..) {
                            let _ = tx.send(Ok(Bytes::from(format!("{held_line}\n")))).await;
                        }
                        let remainder = lines.take_remainder();
                        if !remainder.is_empty() {
                            let _ = tx.send(Ok(Bytes::from(remainder))).await;
                        }
                    }
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

/// Dispatch assembled streaming tool calls; returns the replacement text
/// of the first swallow, if any.
async fn dispatch_assembled(
    reactor: &ToolCallReactor,
    ctx: &ResponseContext,
    assembler: &ToolCallAssembler,
) -> Option<String> {
    for call in assembler.calls() {
        if call.name.is_empty() {
            continue;
        }
        let tc_ctx = ToolCallContext {
            session_id: ctx.session_id.clone(),
            backend_name: ctx.backend_name.clone(),
            model_name: ctx.model_name.clone(),
            full_response: Value::Null,
            tool_name: call.name.clone(),
            tool_arguments: parse_arguments(&call.arguments),
            calling_agent: ctx.calling_agent.clone(),
            timestamp: Utc::now(),
        };
        if let Some(reaction) = reactor.process_tool_call(&tc_ctx).await {
            if reaction.should_swallow {
                return Some(
                    reaction
                        .replacement_response
                        .unwrap_or_else(|| "Tool call intercepted by the proxy.".to_string()),
                );
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
