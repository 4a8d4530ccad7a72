// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini `generateContent` wire format.
//!
//! Request direction builds `contents` / `generationConfig` / `tools`
//! payloads; response direction fully normalizes unary and streaming bodies
//! to the OpenAI chat-completion shape.
//!
//! Gemini has no system role, so system messages are dropped on the way in.
//! Temperature is clamped to `[0, 1]` (Gemini contract) with a warning.

use serde_json::{json, Map, Value};
use tracing::warn;

use prism_domain::{
    parse_data_url_parts, ChatMessage, ChatRequest, ContentPart, MessageContent, ProxyError, Role,
};

// ─── Model id normalization ───────────────────────────────────────────────────

/// Strip routing prefixes from a model id: `gemini:`, `models/`, `gemini/`;
/// any remaining `/` keeps the trailing segment only.
pub fn normalize_model_name(effective_model: &str) -> String {
    let mut name = effective_model;
    if let Some(rest) = name.strip_prefix("gemini:") {
        name = rest;
    }
    if let Some(rest) = name.strip_prefix("models/") {
        name = rest;
    }
    if let Some(rest) = name.strip_prefix("gemini/") {
        name = rest;
    }
    match name.rsplit_once('/') {
        Some((_, tail)) => tail.to_string(),
        None => name.to_string(),
    }
}

// ─── Outbound request ─────────────────────────────────────────────────────────

/// Build a `generateContent` request body from the canonical request.
pub fn build_payload(req: &ChatRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    for m in &req.messages {
        match m.role {
            // Gemini API does not support a system role.
            Role::System => continue,
            Role::Tool | Role::Function => {
                contents.push(json!({
                    "role": "user",
                    "parts": tool_result_parts(m),
                }));
            }
            Role::User => {
                contents.push(json!({ "role": "user", "parts": message_parts(m) }));
            }
            Role::Assistant => {
                contents.push(json!({ "role": "model", "parts": message_parts(m) }));
            }
        }
    }

    let mut payload = json!({ "contents": contents });
    apply_generation_config(&mut payload, req);

    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters,
                })
            })
            .collect();
        payload["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    merge_extra_body_with_generation_config(&mut payload, &req.extra_body);
    payload
}

/// Fold generation parameters under `generationConfig`.
fn apply_generation_config(payload: &mut Value, req: &ChatRequest) {
    let mut config = Map::new();

    if let Some(budget) = req.thinking_budget {
        config.insert("thinkingConfig".into(), json!({ "thinkingBudget": budget }));
    }
    if let Some(gen) = &req.generation_config {
        for (k, v) in gen {
            config.insert(k.clone(), v.clone());
        }
    }
    if let Some(mut temperature) = req.temperature {
        if temperature > 1.0 {
            warn!(temperature, "temperature > 1.0 for Gemini, clamping to 1.0");
            temperature = 1.0;
        }
        config.insert("temperature".into(), json!(temperature));
    }
    if let Some(p) = req.top_p {
        config.insert("topP".into(), json!(p));
    }
    if let Some(k) = req.top_k {
        config.insert("topK".into(), json!(k));
    }
    if let Some(m) = req.max_tokens {
        config.insert("maxOutputTokens".into(), json!(m));
    }
    if let Some(stop) = &req.stop {
        config.insert("stopSequences".into(), json!(stop));
    }

    if !config.is_empty() {
        payload["generationConfig"] = Value::Object(config);
    }
}

/// Merge extra_body, letting its `generationConfig` override individual
/// keys of the computed one instead of replacing the whole object.
fn merge_extra_body_with_generation_config(
    payload: &mut Value,
    extra_body: &Map<String, Value>,
) {
    let mut remaining = extra_body.clone();
    let extra_config = remaining
        .remove("generationConfig")
        .or_else(|| remaining.remove("generation_config"));
    if let Some(Value::Object(extra)) = extra_config {
        let mut merged = payload["generationConfig"]
            .as_object()
            .cloned()
            .unwrap_or_default();
        for (k, v) in extra {
            merged.insert(k, v);
        }
        payload["generationConfig"] = Value::Object(merged);
    }
    crate::merge_extra_body(payload, &remaining);
}

fn message_parts(m: &ChatMessage) -> Vec<Value> {
    if !m.tool_calls.is_empty() {
        return m
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "functionCall": {
                        "name": tc.function.name,
                        "args": serde_json::from_str::<Value>(&tc.function.arguments)
                            .unwrap_or(json!({})),
                    }
                })
            })
            .collect();
    }
    match &m.content {
        MessageContent::Text(t) => vec![json!({ "text": t })],
        MessageContent::Parts(parts) => {
            if parts.is_empty() {
                return vec![json!({ "text": "" })];
            }
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "text": text }),
                    ContentPart::Image { url, mime_type }
                    | ContentPart::Audio { url, mime_type }
                    | ContentPart::Video { url, mime_type }
                    | ContentPart::File { url, mime_type } => {
                        if let Ok((mime, data)) = parse_data_url_parts(url) {
                            json!({ "inlineData": { "mimeType": mime, "data": data } })
                        } else {
                            json!({
                                "fileData": {
                                    "mimeType": mime_type.clone()
                                        .unwrap_or_else(|| "application/octet-stream".into()),
                                    "fileUri": url,
                                }
                            })
                        }
                    }
                })
                .collect()
        }
    }
}

fn tool_result_parts(m: &ChatMessage) -> Vec<Value> {
    let text = m.content.joined_text();
    // Prefer structured payloads; wrap plain strings as {output: ...}.
    let response: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "output": text }));
    let name = m
        .name
        .clone()
        .or_else(|| m.tool_call_id.clone())
        .unwrap_or_else(|| "tool".to_string());
    vec![json!({ "functionResponse": { "name": name, "response": response } })]
}

// ─── Inbound request ──────────────────────────────────────────────────────────

/// Parse a Gemini `generateContent` request body into the canonical
/// request.  `model` comes from the URL path, not the body.
pub fn request_from_wire(v: &Value, model: &str, stream: bool) -> Result<ChatRequest, ProxyError> {
    let contents = v["contents"]
        .as_array()
        .ok_or_else(|| ProxyError::invalid_request("missing contents"))?;
    if contents.is_empty() {
        return Err(ProxyError::invalid_request("contents must be non-empty"));
    }

    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(parts) = v["systemInstruction"]["parts"].as_array() {
        let text = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            messages.push(ChatMessage::system(text));
        }
    }

    for entry in contents {
        let role = match entry["role"].as_str() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut parts_out: Vec<ContentPart> = Vec::new();
        if let Some(parts) = entry["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    parts_out.push(ContentPart::text(text));
                } else if let Some(inline) = part.get("inlineData") {
                    parts_out.push(ContentPart::Image {
                        url: format!(
                            "data:{};base64,{}",
                            inline["mimeType"].as_str().unwrap_or("application/octet-stream"),
                            inline["data"].as_str().unwrap_or_default()
                        ),
                        mime_type: inline["mimeType"].as_str().map(String::from),
                    });
                } else if let Some(file) = part.get("fileData") {
                    parts_out.push(ContentPart::File {
                        url: file["fileUri"].as_str().unwrap_or_default().to_string(),
                        mime_type: file["mimeType"].as_str().map(String::from),
                    });
                }
            }
        }
        let content = crate::collapse_parts(parts_out);
        messages.push(ChatMessage {
            role,
            content,
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        });
    }

    let config = &v["generationConfig"];
    Ok(ChatRequest {
        model: model.to_string(),
        messages,
        temperature: config["temperature"].as_f64(),
        top_p: config["topP"].as_f64(),
        top_k: config["topK"].as_u64().map(|k| k as u32),
        max_tokens: config["maxOutputTokens"].as_u64().map(|m| m as u32),
        stream,
        ..Default::default()
    })
}

// ─── Response conversion ──────────────────────────────────────────────────────

/// Convert a unary Gemini response to the OpenAI chat-completion shape,
/// including function calls.
pub fn response_to_openai(data: &Value, model: &str) -> Value {
    let candidate = &data["candidates"][0];
    let mut text = String::new();
    let mut tool_call: Option<Value> = None;

    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(fc) = part.get("functionCall") {
                let args = serde_json::to_string(&fc["args"]).unwrap_or_else(|_| "{}".into());
                tool_call = Some(json!({
                    "id": "call_0",
                    "type": "function",
                    "function": {
                        "name": fc["name"].as_str().unwrap_or("function"),
                        "arguments": args,
                    },
                }));
            } else if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
        }
    }

    let mut finish_reason: Value = candidate["finishReason"]
        .as_str()
        .map(|f| json!(f.to_lowercase()))
        .unwrap_or(Value::Null);
    let mut message = json!({ "role": "assistant", "content": text });
    if let Some(tc) = tool_call {
        message["content"] = Value::Null;
        message["tool_calls"] = json!([tc]);
        finish_reason = json!("tool_calls");
    }

    let usage = &data["usageMetadata"];
    json!({
        "id": data["id"].as_str().unwrap_or_default(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": candidate["index"].as_u64().unwrap_or(0),
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": usage["promptTokenCount"].as_u64().unwrap_or(0),
            "completion_tokens": usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            "total_tokens": usage["totalTokenCount"].as_u64().unwrap_or(0),
        },
    })
}

/// Convert one Gemini streaming chunk (decoded JSON) to an OpenAI delta
/// chunk.  Function-call parts synthesize `tool_calls` in the terminal
/// delta with `finish_reason: "tool_calls"`.
pub fn stream_chunk_to_openai(data: &Value, model: &str) -> Value {
    let candidate = &data["candidates"][0];
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for (i, part) in parts.iter().enumerate() {
            if let Some(fc) = part.get("functionCall") {
                let args = serde_json::to_string(&fc["args"]).unwrap_or_else(|_| "{}".into());
                tool_calls.push(json!({
                    "id": format!("call_{i}"),
                    "type": "function",
                    "function": {
                        "name": fc["name"].as_str().unwrap_or("function"),
                        "arguments": args,
                    },
                }));
            } else if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
        }
    }

    let mut finish_reason: Value = candidate["finishReason"]
        .as_str()
        .map(|f| json!(f.to_lowercase()))
        .unwrap_or(Value::Null);
    let mut delta = json!({ "content": text });
    if !tool_calls.is_empty() {
        delta["content"] = Value::Null;
        delta["tool_calls"] = json!(tool_calls);
        finish_reason = json!("tool_calls");
    }

    json!({
        "id": data["id"].as_str().unwrap_or_default(),
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": candidate["index"].as_u64().unwrap_or(0),
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Convert an OpenAI chat-completion response back to the Gemini shape,
/// for callers that sent a `generateContent` request.
pub fn response_from_openai(v: &Value) -> Value {
    let choice = &v["choices"][0];
    let message = &choice["message"];

    let mut parts: Vec<Value> = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            parts.push(json!({
                "functionCall": {
                    "name": tc["function"]["name"].as_str().unwrap_or_default(),
                    "args": serde_json::from_str::<Value>(
                        tc["function"]["arguments"].as_str().unwrap_or("{}")
                    ).unwrap_or(json!({})),
                }
            }));
        }
    }

    let finish_reason = match choice["finish_reason"].as_str() {
        Some("length") => "MAX_TOKENS",
        _ => "STOP",
    };

    json!({
        "candidates": [{
            "index": 0,
            "content": { "role": "model", "parts": parts },
            "finishReason": finish_reason,
        }],
        "usageMetadata": {
            "promptTokenCount": v["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "candidatesTokenCount": v["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            "totalTokenCount": v["usage"]["total_tokens"].as_u64().unwrap_or(0),
        },
    })
}

/// Convert an OpenAI delta chunk to a Gemini streaming chunk, for the
/// `streamGenerateContent` egress.
pub fn stream_chunk_from_openai(v: &Value) -> Value {
    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    let mut parts: Vec<Value> = Vec::new();
    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }
    }
    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            parts.push(json!({
                "functionCall": {
                    "name": tc["function"]["name"].as_str().unwrap_or_default(),
                    "args": serde_json::from_str::<Value>(
                        tc["function"]["arguments"].as_str().unwrap_or("{}")
                    ).unwrap_or(json!({})),
                }
            }));
        }
    }

    let mut candidate = json!({
        "index": 0,
        "content": { "role": "model", "parts": parts },
    });
    if let Some(finish) = choice["finish_reason"].as_str() {
        candidate["finishReason"] = json!(finish.to_uppercase());
    }
    json!({ "candidates": [candidate] })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
