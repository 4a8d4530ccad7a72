// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Loop detection.
//!
//! Each assistant turn contributes a signature: tool name plus
//! canonical-JSON arguments for tool calls, or the message text for plain
//! content.  Repeats of the same signature within the TTL window trip the
//! detector.  `Break` mode terminates the turn with a steering message;
//! `ChanceThenBreak` injects a warning on the first trip and breaks on the
//! next.
//!
//! Thresholds are configuration (`tool_loop_max_repeats`,
//! `tool_loop_ttl_seconds`), not invariants; the defaults below apply when
//! the session leaves them unset.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use prism_domain::{ByteStream, ProxyError, ToolLoopMode};

use super::reactor_mw::{extract_tool_calls, parse_arguments};
use super::sse::{
    chunk_has_tool_calls, done_frame, format_event, make_text_chunk, parse_data_line,
    SseEvent, SseLineBuffer, ToolCallAssembler,
};
use super::{ResponseContext, ResponseMiddleware};

pub const DEFAULT_MAX_REPEATS: u32 = 4;
pub const DEFAULT_TTL_SECONDS: u64 = 120;

pub const BREAK_MESSAGE: &str = "Loop detected: the same action has been repeated too many times. \
     The response has been terminated by the proxy. Re-think the current \
     approach instead of re-issuing the identical call.";

pub const CHANCE_MESSAGE: &str = "Warning: you appear to be repeating the same action. If the next \
     response repeats it again, the proxy will terminate the loop.";

#[derive(Default)]
struct SessionLoopState {
    signatures: VecDeque<(u64, DateTime<Utc>)>,
    warned: HashSet<u64>,
}

enum Verdict {
    Pass,
    Chance,
    Break,
}

impl Verdict {
    fn is_break(&self) -> bool {
        matches!(self, Self::Break)
    }
}

pub struct LoopDetectionMiddleware {
    sessions: std::sync::Arc<Mutex<HashMap<String, SessionLoopState>>>,
}

impl Default for LoopDetectionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopDetectionMiddleware {
    pub fn new() -> Self {
        Self { sessions: std::sync::Arc::new(Mutex::new(HashMap::new())) }
    }

    async fn record_and_judge(
        &self,
        ctx: &ResponseContext,
        signature: u64,
    ) -> Verdict {
        let max_repeats = ctx
            .loop_config
            .tool_loop_max_repeats
            .unwrap_or(DEFAULT_MAX_REPEATS) as usize;
        let ttl = ctx
            .loop_config
            .tool_loop_ttl_seconds
            .unwrap_or(DEFAULT_TTL_SECONDS) as i64;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(ttl);

        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(ctx.session_id.clone()).or_default();
        while state.signatures.front().is_some_and(|(_, t)| *t < cutoff) {
            state.signatures.pop_front();
        }
        state.signatures.push_back((signature, now));

        let repeats = state
            .signatures
            .iter()
            .filter(|(sig, _)| *sig == signature)
            .count();
        if repeats <= max_repeats {
            return Verdict::Pass;
        }
        match ctx.loop_config.tool_loop_mode {
            ToolLoopMode::Break => Verdict::Break,
            ToolLoopMode::ChanceThenBreak => {
                if state.warned.insert(signature) {
                    Verdict::Chance
                } else {
                    Verdict::Break
                }
            }
        }
    }
}

/// Hash of a tool call: name plus canonical (key-sorted) JSON arguments.
fn tool_signature(name: &str, arguments: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    canonical_json(arguments).hash(&mut hasher);
    hasher.finish()
}

fn text_signature(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    "text-content".hash(&mut hasher);
    text.hash(&mut hasher);
    hasher.finish()
}

/// Key-order-independent rendering for hashing.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl ResponseMiddleware for LoopDetectionMiddleware {
    fn name(&self) -> &'static str {
        "loop_detection"
    }

    /// Terminal step: runs after every other response middleware.
    fn priority(&self) -> i32 {
        -10
    }

    async fn process_unary(&self, mut response: Value, ctx: &ResponseContext) -> Value {
        let calls = extract_tool_calls(&response);

        if !calls.is_empty() {
            if !ctx.loop_config.tool_loop_detection_enabled {
                return response;
            }
            let mut verdict = Verdict::Pass;
            for call in &calls {
                let signature = tool_signature(&call.name, &parse_arguments(&call.arguments));
                match self.record_and_judge(ctx, signature).await {
                    Verdict::Pass => {}
                    Verdict::Chance => verdict = Verdict::Chance,
                    Verdict::Break => {
                        verdict = Verdict::Break;
                        break;
                    }
                }
            }
            match verdict {
                Verdict::Pass => response,
                Verdict::Chance => {
                    info!(session_id = %ctx.session_id, "tool loop warning injected");
                    inject_text(&mut response, CHANCE_MESSAGE);
                    response
                }
                Verdict::Break => {
                    warn!(session_id = %ctx.session_id, "tool loop broken");
                    break_response(&mut response);
                    response
                }
            }
        } else {
            if !ctx.loop_config.loop_detection_enabled {
                return response;
            }
            let Some(text) = response["choices"][0]["message"]["content"].as_str() else {
                return response;
            };
            if text.is_empty() {
                return response;
            }
            let signature = text_signature(text);
            match self.record_and_judge(ctx, signature).await {
                Verdict::Pass => response,
                Verdict::Chance => {
                    inject_text(&mut response, CHANCE_MESSAGE);
                    response
                }
                Verdict::Break => {
                    warn!(session_id = %ctx.session_id, "response loop broken");
                    break_response(&mut response);
                    response
                }
            }
        }
    }

    fn wrap_stream(&self, stream: ByteStream, ctx: &ResponseContext) -> ByteStream {
        if !ctx.loop_config.tool_loop_detection_enabled {
            return stream;
        }
        // The detector state is shared with the unary path, so repeats are
        // counted across streaming and non-streaming turns alike.
        let ctx = ctx.clone();
        let detector = LoopStreamState { sessions: std::sync::Arc::clone(&self.sessions) };
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, ProxyError>>(16);

        tokio::spawn(async move {
            let mut upstream = stream;
            let mut lines = SseLineBuffer::default();
            let mut assembler = ToolCallAssembler::default();
            let mut held: Vec<String> = Vec::new();
            let mut saw_done = false;

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
                            saw_done = true;
                            let verdict = detector.judge_assembled(&ctx, &assembler).await;
                            match verdict {
                                Verdict::Break => {
                                    warn!(session_id = %ctx.session_id, "tool loop broken in stream");
                                    let chunk = make_text_chunk(
                                        &ctx.model_name,
                                        BREAK_MESSAGE,
                                        Some("stop"),
                                    );
                                    let _ = tx.send(Ok(format_event(&chunk))).await;
                                }
                                Verdict::Chance => {
                                    let chunk =
                                        make_text_chunk(&ctx.model_name, CHANCE_MESSAGE, None);
                                    let _ = tx.send(Ok(format_event(&chunk))).await;
                                    for held_line in held.drain(..) {
                                        let _ = tx
                                            .send(Ok(Bytes::from(format!("{held_line}\n"))))
                                            .await;
                                    }
                                }
                                Verdict::Pass => {
                                    for held_line in held.drain(..) {
                                        let _ = tx
                                            .send(Ok(Bytes::from(format!("{held_line}\n"))))
                                            .await;
                                    }
                                }
                            }
                            let _ = tx.send(Ok(done_frame())).await;
                            break 'outer;
                        }
                        Some(SseEvent::Json(chunk)) => {
                            let holding = !assembler.is_empty();
                            if chunk_has_tool_calls(&chunk) {
                                assembler.feed(&chunk);
                                held.push(line);
                            } else if holding {
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

            // Upstream ended without the sentinel: flush whatever was held
            // so no assembled tool call is silently lost.
            if !saw_done {
                if detector.judge_assembled(&ctx, &assembler).await.is_break() {
                    let chunk = make_text_chunk(&ctx.model_name, BREAK_MESSAGE, Some("stop"));
                    let _ = tx.send(Ok(format_event(&chunk))).await;
                } else {
                    for held_line in held.drain(..) {
                        let _ = tx.send(Ok(Bytes::from(format!("{held_line}\n")))).await;
                    }
                    let remainder = lines.take_remainder();
                    if !remainder.is_empty() {
                        let _ = tx.send(Ok(Bytes::from(remainder))).await;
                    }
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

/// Shared view of the middleware state for the streaming task.
struct LoopStreamState {
    sessions: std::sync::Arc<Mutex<HashMap<String, SessionLoopState>>>,
}

impl LoopStreamState {
    async fn judge_assembled(
        &self,
        ctx: &ResponseContext,
        assembler: &ToolCallAssembler,
    ) -> Verdict {
        let max_repeats = ctx
            .loop_config
            .tool_loop_max_repeats
            .unwrap_or(DEFAULT_MAX_REPEATS) as usize;
        let ttl = ctx
            .loop_config
            .tool_loop_ttl_seconds
            .unwrap_or(DEFAULT_TTL_SECONDS) as i64;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(ttl);

        let mut verdict = Verdict::Pass;
        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(ctx.session_id.clone()).or_default();
        while state.signatures.front().is_some_and(|(_, t)| *t < cutoff) {
            state.signatures.pop_front();
        }
        for call in assembler.calls() {
            if call.name.is_empty() {
                continue;
            }
            let signature = tool_signature(&call.name, &parse_arguments(&call.arguments));
            state.signatures.push_back((signature, now));
            let repeats = state
                .signatures
                .iter()
                .filter(|(sig, _)| *sig == signature)
                .count();
            if repeats <= max_repeats {
                continue;
            }
            match ctx.loop_config.tool_loop_mode {
                ToolLoopMode::Break => return Verdict::Break,
                ToolLoopMode::ChanceThenBreak => {
                    if state.warned.insert(signature) {
                        verdict = Verdict::Chance;
                    } else {
                        return Verdict::Break;
                    }
                }
            }
        }
        verdict
    }
}

fn inject_text(response: &mut Value, message: &str) {
    let content = &mut response["choices"][0]["message"]["content"];
    match content.as_str() {
        Some(existing) if !existing.is_empty() => {
            *content = json!(format!("{existing}\n\n{message}"));
        }
        _ => *content = json!(message),
    }
}

fn break_response(response: &mut Value) {
    let choice = &mut response["choices"][0];
    choice["message"]["content"] = json!(BREAK_MESSAGE);
    if let Some(obj) = choice["message"].as_object_mut() {
        obj.remove("tool_calls");
    }
    choice["finish_reason"] = json!("stop");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
