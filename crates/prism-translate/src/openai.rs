// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI chat-completions wire format.
//!
//! This is the canonical model's home format, so translation is close to
//! the identity: the work is in content-part conversion, `extra_body`
//! merging, and clearing of internal `_`-prefixed keys before the payload
//! leaves the process.

use serde_json::{json, Value};

use prism_domain::{
    ChatMessage, ChatRequest, ContentPart, FunctionCall, MessageContent, ProxyError, Role,
    ToolCall, ToolChoice, ToolDefinition,
};

use crate::merge_extra_body;

// ─── Inbound ──────────────────────────────────────────────────────────────────

/// Parse an OpenAI-format request body into the canonical request.
pub fn request_from_wire(v: &Value) -> Result<ChatRequest, ProxyError> {
    let model = v["model"]
        .as_str()
        .ok_or_else(|| ProxyError::invalid_request("missing model"))?
        .to_string();

    let raw_messages = v["messages"]
        .as_array()
        .ok_or_else(|| ProxyError::invalid_request("missing messages"))?;
    if raw_messages.is_empty() {
        return Err(ProxyError::invalid_request("messages must be non-empty"));
    }
    let messages = raw_messages
        .iter()
        .map(message_from_wire)
        .collect::<Result<Vec<_>, _>>()?;

    let tools = v
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| serde_json::from_value::<ToolDefinition>(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = v
        .get("tool_choice")
        .filter(|tc| !tc.is_null())
        .and_then(|tc| serde_json::from_value::<ToolChoice>(tc.clone()).ok());

    let stop = match v.get("stop") {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
        ),
        _ => None,
    };

    let extra_body = v
        .get("extra_body")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let temperature = v["temperature"].as_f64();
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(ProxyError::InvalidRequest {
                message: format!("temperature {t} out of range [0, 2]"),
                param: Some("temperature".into()),
                code: None,
            });
        }
    }
    let top_p = v["top_p"].as_f64();
    if let Some(p) = top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(ProxyError::InvalidRequest {
                message: format!("top_p {p} out of range [0, 1]"),
                param: Some("top_p".into()),
                code: None,
            });
        }
    }

    Ok(ChatRequest {
        model,
        messages,
        temperature,
        top_p,
        top_k: v["top_k"].as_u64().map(|k| k as u32),
        max_tokens: v["max_tokens"].as_u64().map(|m| m as u32),
        seed: v["seed"].as_u64(),
        stream: v["stream"].as_bool().unwrap_or(false),
        stop,
        reasoning_effort: v["reasoning_effort"].as_str().map(String::from),
        thinking_budget: v["thinking_budget"].as_u64().map(|b| b as u32),
        generation_config: v
            .get("generation_config")
            .and_then(Value::as_object)
            .cloned(),
        tools,
        tool_choice,
        extra_body,
    })
}

/// Parse one OpenAI wire message.
pub fn message_from_wire(v: &Value) -> Result<ChatMessage, ProxyError> {
    let role = match v["role"].as_str() {
        Some("system") => Role::System,
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("tool") => Role::Tool,
        Some("function") => Role::Function,
        other => {
            return Err(ProxyError::invalid_request(format!(
                "unknown message role: {other:?}"
            )))
        }
    };

    let content = match &v["content"] {
        Value::String(s) => MessageContent::Text(s.clone()),
        Value::Array(parts) => MessageContent::Parts(
            parts.iter().filter_map(part_from_wire).collect(),
        ),
        Value::Null => MessageContent::Text(String::new()),
        other => MessageContent::Text(other.to_string()),
    };

    let tool_calls = v
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    Some(ToolCall {
                        id: tc["id"].as_str().unwrap_or_default().to_string(),
                        kind: tc["type"].as_str().unwrap_or("function").to_string(),
                        function: FunctionCall {
                            name: tc["function"]["name"].as_str()?.to_string(),
                            arguments: tc["function"]["arguments"]
                                .as_str()
                                .unwrap_or("{}")
                                .to_string(),
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatMessage {
        role,
        content,
        name: v["name"].as_str().map(String::from),
        tool_call_id: v["tool_call_id"].as_str().map(String::from),
        tool_calls,
    })
}

fn part_from_wire(v: &Value) -> Option<ContentPart> {
    match v["type"].as_str()? {
        "text" => Some(ContentPart::text(v["text"].as_str()?)),
        "image_url" => Some(ContentPart::Image {
            url: v["image_url"]["url"].as_str()?.to_string(),
            mime_type: None,
        }),
        "input_audio" => Some(ContentPart::Audio {
            url: v["input_audio"]["data"].as_str()?.to_string(),
            mime_type: v["input_audio"]["format"].as_str().map(String::from),
        }),
        "file" => Some(ContentPart::File {
            url: v["file"]["file_data"].as_str()?.to_string(),
            mime_type: None,
        }),
        _ => None,
    }
}

// ─── Outbound ─────────────────────────────────────────────────────────────────

/// Build the upstream request body for an OpenAI-compatible endpoint.
///
/// `extra_body` is merged last (minus internal keys) so callers can
/// fine-tune provider behavior without code changes.
pub fn build_payload(req: &ChatRequest, effective_model: &str) -> Value {
    let mut body = json!({
        "model": effective_model,
        "messages": messages_to_wire(&req.messages),
        "stream": req.stream,
    });
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(m) = req.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if let Some(s) = req.seed {
        body["seed"] = json!(s);
    }
    if let Some(stop) = &req.stop {
        body["stop"] = json!(stop);
    }
    if let Some(effort) = &req.reasoning_effort {
        body["reasoning_effort"] = json!(effort);
    }
    if !req.tools.is_empty() {
        body["tools"] = serde_json::to_value(&req.tools).unwrap_or(Value::Null);
    }
    if let Some(choice) = &req.tool_choice {
        body["tool_choice"] = serde_json::to_value(choice).unwrap_or(Value::Null);
    }
    merge_extra_body(&mut body, &req.extra_body);
    body
}

/// Convert canonical messages to the OpenAI wire array.
pub fn messages_to_wire(messages: &[ChatMessage]) -> Vec<Value> {
    messages.iter().map(message_to_wire).collect()
}

fn message_to_wire(m: &ChatMessage) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::Function => "function",
    };

    let content: Value = match &m.content {
        MessageContent::Text(t) => {
            // Assistant tool-call turns send null content when no text.
            if t.is_empty() && !m.tool_calls.is_empty() {
                Value::Null
            } else {
                json!(t)
            }
        }
        MessageContent::Parts(parts) if !parts.is_empty() => {
            let wire_parts: Vec<Value> = parts.iter().filter_map(part_to_wire).collect();
            json!(wire_parts)
        }
        MessageContent::Parts(_) => json!(""),
    };

    let mut out = json!({ "role": role, "content": content });
    if let Some(name) = &m.name {
        out["name"] = json!(name);
    }
    if let Some(id) = &m.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if !m.tool_calls.is_empty() {
        out["tool_calls"] = serde_json::to_value(&m.tool_calls).unwrap_or(Value::Null);
    }
    out
}

fn part_to_wire(p: &ContentPart) -> Option<Value> {
    match p {
        ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentPart::Image { url, .. } => Some(json!({
            "type": "image_url",
            "image_url": { "url": url },
        })),
        // No stable OpenAI chat wire form; dropped (provider-native only).
        ContentPart::Audio { .. } | ContentPart::Video { .. } | ContentPart::File { .. } => None,
    }
}

/// Build a complete OpenAI-shape unary response from plain text, used for
/// command-only turns answered by the proxy itself.
pub fn local_text_response(model: &str, text: &str) -> Value {
    json!({
        "id": format!("proxy-{}", uuid_like()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
    })
}

fn uuid_like() -> String {
    // Millisecond timestamp is unique enough for a local response id.
    format!("{:x}", chrono::Utc::now().timestamp_millis())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
