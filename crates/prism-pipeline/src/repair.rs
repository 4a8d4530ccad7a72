// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort JSON repair.
//!
//! [`repair_json`] takes malformed JSON text and returns a valid JSON
//! string when it can: single-quoted strings, Python-style literals,
//! trailing commas, and unclosed strings/brackets are fixed; anything
//! beyond that fails.  Valid input is returned unchanged.
//!
//! [`StreamingJsonRepairProcessor`] applies the primitive to a text
//! stream: non-JSON prefix text passes through character-for-character, a
//! `{` or `[` starts buffering, and the buffered slice is repaired and
//! re-emitted once the bracket depth returns to zero outside a string.

use serde_json::Value;
use tracing::{debug, warn};

/// Repair `payload` into a valid JSON string.
///
/// Returns `Err` for empty input and for text that still fails to parse
/// after the repair passes.
pub fn repair_json(payload: &str) -> Result<String, ()> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(());
    }
    if serde_json::from_str::<Value>(payload).is_ok() {
        return Ok(payload.to_string());
    }

    let mut candidate = normalize_literals(payload);
    candidate = strip_trailing_commas(&candidate);
    candidate = close_open_structures(&candidate);

    match serde_json::from_str::<Value>(&candidate) {
        Ok(value) => Ok(serde_json::to_string(&value).map_err(|_| ())?),
        Err(_) => Err(()),
    }
}

/// Repair and optionally validate against a minimal schema
/// (`type` and `required` keys).  `strict` refuses any repair that had to
/// modify the input.
pub fn repair_and_validate(
    payload: &str,
    strict: bool,
    schema: Option<&Value>,
) -> Option<Value> {
    let repaired = if strict {
        serde_json::from_str::<Value>(payload.trim()).ok()?;
        payload.trim().to_string()
    } else {
        repair_json(payload).ok()?
    };
    let value: Value = serde_json::from_str(&repaired).ok()?;
    if let Some(schema) = schema {
        if !matches_schema(&value, schema) {
            return None;
        }
    }
    Some(value)
}

/// Structural check: `type` and `required` only.  Full JSON Schema is out
/// of scope for the repair path.
fn matches_schema(value: &Value, schema: &Value) -> bool {
    if let Some(ty) = schema["type"].as_str() {
        let ok = match ty {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    if let Some(required) = schema["required"].as_array() {
        if let Some(obj) = value.as_object() {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return false;
                }
            }
        }
    }
    true
}

/// Convert single-quoted strings to double-quoted and Python literals to
/// their JSON forms, outside of strings.
fn normalize_literals(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            if ch == '\\' {
                escaped = true;
                out.push(ch);
                continue;
            }
            if ch == quote {
                in_string = None;
                out.push('"');
                continue;
            }
            // A double quote inside a single-quoted string must be escaped
            // once the delimiters become double quotes.
            if ch == '"' && quote == '\'' {
                out.push_str("\\\"");
                continue;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' | '\'' => {
                in_string = Some(ch);
                out.push('"');
            }
            'T' if follows_keyword(&mut chars, "rue") => out.push_str("true"),
            'F' if follows_keyword(&mut chars, "alse") => out.push_str("false"),
            'N' if follows_keyword(&mut chars, "one") => out.push_str("null"),
            _ => out.push(ch),
        }
    }
    out
}

/// Consume `rest` from the iterator when it matches; used for the
/// Python literal keywords.
fn follows_keyword(chars: &mut std::iter::Peekable<std::str::Chars>, rest: &str) -> bool {
    let mut lookahead = chars.clone();
    for expected in rest.chars() {
        if lookahead.next() != Some(expected) {
            return false;
        }
    }
    for _ in rest.chars() {
        chars.next();
    }
    true
}

/// Remove commas that directly precede a closing bracket.
fn strip_trailing_commas(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in src.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                while out.ends_with(|c: char| c.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Close an unterminated string and append missing closers in stack order.
fn close_open_structures(src: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in src.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = src.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    if out.ends_with(':') {
        out.push_str(" null");
    } else if out.ends_with(',') {
        out.pop();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

// ─── Streaming processor ──────────────────────────────────────────────────────

/// Stateful bracket-counting repair buffer for text streams.
///
/// Feed chunks with [`process_chunk`](Self::process_chunk); whatever it
/// returns is ready to emit downstream.  Call [`finish`](Self::finish)
/// at end of stream to flush a pending buffer.
pub struct StreamingJsonRepairProcessor {
    buffer_cap_bytes: usize,
    strict_mode: bool,
    schema: Option<Value>,
    buffer: String,
    brace_level: usize,
    in_string: bool,
    escaped: bool,
    json_started: bool,
}

impl StreamingJsonRepairProcessor {
    pub fn new(buffer_cap_bytes: usize, strict_mode: bool, schema: Option<Value>) -> Self {
        Self {
            buffer_cap_bytes,
            strict_mode,
            schema,
            buffer: String::new(),
            brace_level: 0,
            in_string: false,
            escaped: false,
            json_started: false,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.brace_level = 0;
        self.in_string = false;
        self.escaped = false;
        self.json_started = false;
    }

    /// Process one chunk, returning the text to emit.
    pub fn process_chunk(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for ch in chunk.chars() {
            if !self.json_started {
                if ch == '{' || ch == '[' {
                    self.json_started = true;
                    self.buffer.push(ch);
                    self.brace_level = 1;
                } else {
                    out.push(ch);
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
            } else {
                match ch {
                    '"' => self.in_string = true,
                    '{' | '[' => self.brace_level += 1,
                    '}' | ']' => self.brace_level = self.brace_level.saturating_sub(1),
                    _ => {}
                }
            }
            self.buffer.push(ch);

            if self.brace_level == 0 && !self.in_string {
                out.push_str(&self.flush_buffer(false));
            }
        }

        // Soft cap: keep buffering until the value closes, but say so.
        if self.json_started && self.buffer.len() > self.buffer_cap_bytes {
            warn!(
                buffered = self.buffer.len(),
                cap = self.buffer_cap_bytes,
                "JSON repair buffer exceeded soft cap; continuing to buffer"
            );
        }
        out
    }

    /// Flush any pending buffer at end of stream.
    pub fn finish(&mut self) -> String {
        if !self.json_started || self.buffer.is_empty() {
            self.reset();
            return String::new();
        }
        debug!("flushing remaining repair buffer at end of stream");
        let dangling_colon = !self.in_string && self.buffer.trim_end().ends_with(':');
        self.flush_buffer(dangling_colon)
    }

    fn flush_buffer(&mut self, append_null: bool) -> String {
        let mut candidate = std::mem::take(&mut self.buffer);
        let raw = candidate.clone();
        if append_null {
            candidate.push_str(" null");
        }
        let emitted = match repair_and_validate(&candidate, self.strict_mode, self.schema.as_ref())
        {
            Some(value) => serde_json::to_string(&value).unwrap_or(raw),
            None => {
                warn!("JSON block detected but failed to repair; flushing raw buffer");
                raw
            }
        };
        self.reset();
        emitted
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── repair_json ───────────────────────────────────────────────────────────

    #[test]
    fn valid_json_is_returned_unchanged() {
        assert_eq!(repair_json(r#"{"a": 1}"#).unwrap(), r#"{"a": 1}"#);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(repair_json("").is_err());
        assert!(repair_json("   ").is_err());
    }

    #[test]
    fn single_quotes_are_repaired() {
        let out = repair_json(r#"{'a': 'b'}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["a"], "b");
    }

    #[test]
    fn python_literals_are_repaired() {
        let out = repair_json(r#"{"a": True, "b": False, "c": None}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!({"a": true, "b": false, "c": null}));
    }

    #[test]
    fn trailing_commas_are_removed() {
        let out = repair_json(r#"{"a": [1, 2,], }"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!({"a": [1, 2]}));
    }

    #[test]
    fn unclosed_brackets_are_closed() {
        let out = repair_json(r#"{"a": {"b": [1, 2"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v, json!({"a": {"b": [1, 2]}}));
    }

    #[test]
    fn unclosed_string_is_terminated() {
        let out = repair_json(r#"{"a": "hel"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["a"], "hel");
    }

    #[test]
    fn hopeless_input_fails() {
        assert!(repair_json("not json at all").is_err());
    }

    #[test]
    fn strict_mode_rejects_anything_invalid() {
        assert!(repair_and_validate(r#"{'a': 1}"#, true, None).is_none());
        assert!(repair_and_validate(r#"{"a": 1}"#, true, None).is_some());
    }

    #[test]
    fn schema_required_keys_are_enforced() {
        let schema = json!({"type": "object", "required": ["command"]});
        assert!(repair_and_validate(r#"{"command": "ls"}"#, false, Some(&schema)).is_some());
        assert!(repair_and_validate(r#"{"other": 1}"#, false, Some(&schema)).is_none());
    }

    // ── Streaming processor ───────────────────────────────────────────────────

    fn run(chunks: &[&str]) -> Vec<String> {
        let mut p = StreamingJsonRepairProcessor::new(1024, false, None);
        let mut out: Vec<String> = chunks.iter().map(|c| p.process_chunk(c)).collect();
        out.push(p.finish());
        out.into_iter().filter(|s| !s.is_empty()).collect()
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(run(&["hello ", "world"]), vec!["hello ", "world"]);
    }

    #[test]
    fn split_json_object_is_reassembled() {
        // Spec scenario: `pre {"a":1,"b":` · `2` · `}` · `post`.
        let out = run(&[r#"pre {"a":1,"b":"#, "2", "}", "post"]);
        assert_eq!(out, vec!["pre ", r#"{"a":1,"b":2}"#, "post"]);
    }

    #[test]
    fn malformed_object_is_repaired_on_close() {
        let out = run(&["{'cmd': 'ls',}"]);
        assert_eq!(out.len(), 1);
        let v: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v["cmd"], "ls");
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_object() {
        let out = run(&[r#"{"text": "a } b", "n": 1}"#]);
        let v: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v["text"], "a } b");
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn nested_arrays_count_depth() {
        // One chunk: passthrough text and the re-serialized array land in
        // the same emitted string.
        let out = run(&[r#"x [[1, 2], [3]] y"#]);
        assert_eq!(out, vec!["x [[1,2],[3]] y"]);
    }

    #[test]
    fn eof_with_dangling_colon_appends_null() {
        let out = run(&[r#"{"a":"#]);
        let v: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v, json!({"a": null}));
    }

    #[test]
    fn eof_with_partial_object_is_repaired() {
        let out = run(&[r#"{"a": 1, "b": [2"#]);
        let v: Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v, json!({"a": 1, "b": [2]}));
    }

    #[test]
    fn unrepairable_buffer_is_flushed_raw() {
        let mut p = StreamingJsonRepairProcessor::new(1024, true, None);
        // strict mode refuses the repair, so the raw text comes back.
        let mut out = p.process_chunk("{broken");
        out.push_str(&p.finish());
        assert_eq!(out, "{broken");
    }

    #[test]
    fn buffer_at_soft_cap_still_completes() {
        let mut p = StreamingJsonRepairProcessor::new(8, false, None);
        let payload = r#"{"key": "a long value beyond the cap"}"#;
        let mut out = String::new();
        for ch in payload.chars() {
            out.push_str(&p.process_chunk(&ch.to_string()));
        }
        out.push_str(&p.finish());
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["key"], "a long value beyond the cap");
    }

    #[test]
    fn no_json_means_no_op() {
        // Wrapping a stream that never contains `{` or `[` must be the
        // identity transform.
        let chunks = ["The answer ", "is 42. ", "No structures here."];
        assert_eq!(run(&chunks).join(""), chunks.join(""));
    }

    #[test]
    fn two_objects_in_sequence_both_repair() {
        let out = run(&["{'a':1} and {'b':2}"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], r#"{"a":1} and {"b":2}"#);
    }
}
