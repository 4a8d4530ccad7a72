// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SSE plumbing shared by the streaming response middlewares.
//!
//! SSE events can be split across TCP chunks, so a line buffer is carried
//! forward and only complete `\n`-terminated lines are surfaced.

use bytes::Bytes;
use serde_json::{json, Value};

/// Carries partial SSE lines across byte chunks.
#[derive(Default)]
pub struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    /// Append a chunk and drain every complete line (without `\n`).
    pub fn push_and_drain(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            lines.push(line);
        }
        lines
    }

    /// Whatever is left after the final chunk.
    pub fn take_remainder(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }
}

/// A parsed `data:` line.
pub enum SseEvent {
    Done,
    Json(Value),
}

/// Parse one SSE line.  Non-`data:` lines (comments, ids, blanks) return
/// `None` and should be forwarded untouched.
pub fn parse_data_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    serde_json::from_str::<Value>(data).ok().map(SseEvent::Json)
}

/// Frame a JSON value as one SSE event.
pub fn format_event(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Does this delta chunk carry tool-call fragments?
pub fn chunk_has_tool_calls(chunk: &Value) -> bool {
    chunk["choices"]
        .as_array()
        .is_some_and(|choices| {
            choices.iter().any(|c| {
                c["delta"]["tool_calls"]
                    .as_array()
                    .is_some_and(|tc| !tc.is_empty())
            })
        })
}

/// Synthesize a text delta chunk in the OpenAI streaming shape.
pub fn make_text_chunk(model: &str, content: &str, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "",
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": content },
            "finish_reason": finish_reason,
        }],
    })
}

/// Accumulates streamed tool-call fragments into complete calls.
///
/// OpenAI streams each call as an opening fragment (id + name) followed by
/// argument fragments, all routed by the `index` field.
#[derive(Default)]
pub struct ToolCallAssembler {
    calls: Vec<AssembledToolCall>,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallAssembler {
    pub fn feed(&mut self, chunk: &Value) {
        let Some(choices) = chunk["choices"].as_array() else {
            return;
        };
        for choice in choices {
            let Some(fragments) = choice["delta"]["tool_calls"].as_array() else {
                continue;
            };
            for fragment in fragments {
                let index = fragment["index"].as_u64().unwrap_or(0) as usize;
                while self.calls.len() <= index {
                    self.calls.push(AssembledToolCall::default());
                }
                let call = &mut self.calls[index];
                if let Some(id) = fragment["id"].as_str() {
                    if !id.is_empty() {
                        call.id = id.to_string();
                    }
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    if !name.is_empty() {
                        call.name = name.to_string();
                    }
                }
                if let Some(args) = fragment["function"]["arguments"].as_str() {
                    call.arguments.push_str(args);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn calls(&self) -> &[AssembledToolCall] {
        &self.calls
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_split_lines() {
        let mut buf = SseLineBuffer::default();
        assert!(buf.push_and_drain(b"data: {\"a\":").is_empty());
        let lines = buf.push_and_drain(b"1}\n\n");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string(), String::new()]);
    }

    #[test]
    fn line_buffer_strips_crlf() {
        let mut buf = SseLineBuffer::default();
        let lines = buf.push_and_drain(b"data: [DONE]\r\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
    }

    #[test]
    fn parse_recognizes_done_and_json() {
        assert!(matches!(parse_data_line("data: [DONE]"), Some(SseEvent::Done)));
        match parse_data_line(r#"data: {"x":1}"#) {
            Some(SseEvent::Json(v)) => assert_eq!(v["x"], 1),
            other => panic!("unexpected: {:?}", other.is_some()),
        }
        assert!(parse_data_line(": comment").is_none());
        assert!(parse_data_line("").is_none());
    }

    #[test]
    fn assembler_joins_fragments_by_index() {
        let mut assembler = ToolCallAssembler::default();
        assembler.feed(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "c0", "function": {"name": "grep", "arguments": ""}},
            ]}}]
        }));
        assembler.feed(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"q\":"}},
            ]}}]
        }));
        assembler.feed(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"x\"}"}},
            ]}}]
        }));
        let calls = assembler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c0");
        assert_eq!(calls[0].name, "grep");
        assert_eq!(calls[0].arguments, "{\"q\":\"x\"}");
    }

    #[test]
    fn assembler_tracks_parallel_calls() {
        let mut assembler = ToolCallAssembler::default();
        assembler.feed(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "a", "function": {"name": "one", "arguments": "{}"}},
                {"index": 1, "id": "b", "function": {"name": "two", "arguments": "{}"}},
            ]}}]
        }));
        assert_eq!(assembler.calls().len(), 2);
        assert_eq!(assembler.calls()[1].name, "two");
    }

    #[test]
    fn tool_call_chunks_are_detected() {
        let with = json!({"choices": [{"delta": {"tool_calls": [{"index": 0}]}}]});
        let without = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert!(chunk_has_tool_calls(&with));
        assert!(!chunk_has_tool_calls(&without));
    }
}
