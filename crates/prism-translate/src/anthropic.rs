// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic messages wire format.
//!
//! Inbound: the top-level `system` field becomes a leading system message;
//! `tool_use` / `tool_result` blocks become canonical tool calls and tool
//! messages.  Outbound: system messages are split back out, and assistant
//! responses collapse consecutive text blocks while mapping `tool_use`
//! blocks to `tool_calls[]`.

use serde_json::{json, Value};

use prism_domain::{
    parse_data_url_parts, ChatMessage, ChatRequest, ContentPart, MessageContent, ProxyError, Role,
    ToolCall,
};

// ─── Inbound ──────────────────────────────────────────────────────────────────

/// Parse an Anthropic-format request body into the canonical request.
pub fn request_from_wire(v: &Value) -> Result<ChatRequest, ProxyError> {
    let model = v["model"]
        .as_str()
        .ok_or_else(|| ProxyError::invalid_request("missing model"))?
        .to_string();

    let mut messages: Vec<ChatMessage> = Vec::new();

    // Top-level system field: plain string or a list of text blocks.
    match &v["system"] {
        Value::String(s) => messages.push(ChatMessage::system(s.clone())),
        Value::Array(blocks) => {
            let text = blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                messages.push(ChatMessage::system(text));
            }
        }
        _ => {}
    }

    let raw = v["messages"]
        .as_array()
        .ok_or_else(|| ProxyError::invalid_request("missing messages"))?;
    if raw.is_empty() {
        return Err(ProxyError::invalid_request("messages must be non-empty"));
    }
    for m in raw {
        messages.extend(message_from_wire(m)?);
    }

    let mut extra_body = serde_json::Map::new();
    if let Some(k) = v["top_k"].as_u64() {
        extra_body.insert("top_k".into(), json!(k));
    }

    Ok(ChatRequest {
        model,
        messages,
        temperature: v["temperature"].as_f64(),
        top_p: v["top_p"].as_f64(),
        top_k: v["top_k"].as_u64().map(|k| k as u32),
        max_tokens: v["max_tokens"].as_u64().map(|m| m as u32),
        stream: v["stream"].as_bool().unwrap_or(false),
        stop: v["stop_sequences"].as_array().map(|arr| {
            arr.iter().filter_map(Value::as_str).map(String::from).collect()
        }),
        tools: v
            .get("tools")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| {
                        Some(prism_domain::ToolDefinition {
                            kind: "function".into(),
                            function: prism_domain::FunctionSpec {
                                name: t["name"].as_str()?.to_string(),
                                description: t["description"].as_str().unwrap_or_default().into(),
                                parameters: t["input_schema"].clone(),
                            },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        extra_body,
        ..Default::default()
    })
}

/// One Anthropic message can expand to several canonical messages (each
/// `tool_result` block becomes its own tool message).
fn message_from_wire(v: &Value) -> Result<Vec<ChatMessage>, ProxyError> {
    let role = match v["role"].as_str() {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        other => {
            return Err(ProxyError::invalid_request(format!(
                "unknown message role: {other:?}"
            )))
        }
    };

    match &v["content"] {
        Value::String(s) => Ok(vec![match role {
            Role::User => ChatMessage::user(s.clone()),
            _ => ChatMessage::assistant(s.clone()),
        }]),
        Value::Array(blocks) => {
            let mut out: Vec<ChatMessage> = Vec::new();
            let mut parts: Vec<ContentPart> = Vec::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        parts.push(ContentPart::text(block["text"].as_str().unwrap_or_default()));
                    }
                    Some("image") => {
                        let source = &block["source"];
                        let url = if source["type"] == "base64" {
                            format!(
                                "data:{};base64,{}",
                                source["media_type"].as_str().unwrap_or("image/png"),
                                source["data"].as_str().unwrap_or_default()
                            )
                        } else {
                            source["url"].as_str().unwrap_or_default().to_string()
                        };
                        parts.push(ContentPart::Image { url, mime_type: None });
                    }
                    Some("tool_use") => {
                        tool_calls.push(ToolCall::function(
                            block["id"].as_str().unwrap_or_default(),
                            block["name"].as_str().unwrap_or_default(),
                            serde_json::to_string(&block["input"]).unwrap_or_else(|_| "{}".into()),
                        ));
                    }
                    Some("tool_result") => {
                        let content = match &block["content"] {
                            Value::String(s) => s.clone(),
                            Value::Array(inner) => inner
                                .iter()
                                .filter_map(|b| b["text"].as_str())
                                .collect::<Vec<_>>()
                                .join("\n"),
                            _ => String::new(),
                        };
                        out.push(ChatMessage::tool_result(
                            block["tool_use_id"].as_str().unwrap_or_default(),
                            content,
                        ));
                    }
                    _ => {}
                }
            }

            if !parts.is_empty() || !tool_calls.is_empty() {
                let content = crate::collapse_parts(parts);
                out.insert(
                    0,
                    ChatMessage {
                        role,
                        content,
                        name: None,
                        tool_call_id: None,
                        tool_calls,
                    },
                );
            }
            Ok(out)
        }
        _ => Ok(vec![]),
    }
}

// ─── Outbound ─────────────────────────────────────────────────────────────────

/// Build an Anthropic `/v1/messages` request body from the canonical
/// request.  Returns the payload with system messages hoisted to the
/// top-level `system` field.
pub fn build_payload(req: &ChatRequest, effective_model: &str) -> Value {
    let mut system_text = String::new();
    let mut messages: Vec<Value> = Vec::new();

    for m in &req.messages {
        match m.role {
            Role::System => {
                if let Some(t) = m.as_text() {
                    if !system_text.is_empty() {
                        system_text.push_str("\n\n");
                    }
                    system_text.push_str(t);
                }
            }
            Role::Assistant if !m.tool_calls.is_empty() => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(t) = m.as_text() {
                    if !t.is_empty() {
                        blocks.push(json!({ "type": "text", "text": t }));
                    }
                }
                for tc in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.function.name,
                        "input": serde_json::from_str::<Value>(&tc.function.arguments)
                            .unwrap_or(json!({})),
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool | Role::Function => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content.joined_text(),
                    }],
                }));
            }
            _ => {
                let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                messages.push(json!({ "role": role, "content": content_to_wire(&m.content) }));
            }
        }
    }

    let mut body = json!({
        "model": effective_model,
        "messages": messages,
        "max_tokens": req.max_tokens.unwrap_or(4096),
        "stream": req.stream,
    });
    if !system_text.is_empty() {
        body["system"] = json!(system_text);
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(k) = req.top_k {
        body["top_k"] = json!(k);
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    crate::merge_extra_body(&mut body, &req.extra_body);
    body
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(t) => json!(t),
        MessageContent::Parts(parts) if !parts.is_empty() => {
            let blocks: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::Image { url, .. } => {
                        if let Ok((mime, data)) = parse_data_url_parts(url) {
                            Some(json!({
                                "type": "image",
                                "source": { "type": "base64", "media_type": mime, "data": data },
                            }))
                        } else {
                            Some(json!({
                                "type": "image",
                                "source": { "type": "url", "url": url },
                            }))
                        }
                    }
                    _ => None,
                })
                .collect();
            json!(blocks)
        }
        MessageContent::Parts(_) => json!(""),
    }
}

// ─── Response conversion ──────────────────────────────────────────────────────

/// Convert an Anthropic messages response to the OpenAI chat-completion
/// shape.  Consecutive text blocks collapse concatenatively; `tool_use`
/// blocks map to `tool_calls[]`.
pub fn response_to_openai(v: &Value, model: &str) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(json!({
                    "id": block["id"].as_str().unwrap_or("call_0"),
                    "type": "function",
                    "function": {
                        "name": block["name"].as_str().unwrap_or_default(),
                        "arguments": serde_json::to_string(&block["input"])
                            .unwrap_or_else(|_| "{}".into()),
                    },
                })),
                _ => {}
            }
        }
    }

    let finish_reason = match v["stop_reason"].as_str() {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    };

    let mut message = json!({ "role": "assistant", "content": text });
    if !tool_calls.is_empty() {
        message["content"] = Value::Null;
        message["tool_calls"] = json!(tool_calls);
    }

    let usage = &v["usage"];
    let prompt = usage["input_tokens"].as_u64().unwrap_or(0);
    let completion = usage["output_tokens"].as_u64().unwrap_or(0);

    json!({
        "id": v["id"].as_str().unwrap_or_default(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        },
    })
}

/// Convert an OpenAI chat-completion response to the Anthropic messages
/// shape, for callers that sent an Anthropic-format request.
pub fn response_from_openai(v: &Value) -> Value {
    let choice = &v["choices"][0];
    let message = &choice["message"];

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            content.push(json!({
                "type": "tool_use",
                "id": tc["id"].as_str().unwrap_or("call_0"),
                "name": tc["function"]["name"].as_str().unwrap_or_default(),
                "input": serde_json::from_str::<Value>(
                    tc["function"]["arguments"].as_str().unwrap_or("{}")
                ).unwrap_or(json!({})),
            }));
        }
    }

    let stop_reason = match choice["finish_reason"].as_str() {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };

    json!({
        "id": v["id"].as_str().unwrap_or_default(),
        "type": "message",
        "role": "assistant",
        "model": v["model"].as_str().unwrap_or_default(),
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": v["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "output_tokens": v["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        },
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_field_becomes_leading_system_message() {
        let v = json!({
            "model": "claude-3-opus",
            "system": "be helpful",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let req = request_from_wire(&v).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].as_text(), Some("be helpful"));
        assert_eq!(req.messages[1].as_text(), Some("hi"));
    }

    #[test]
    fn outbound_splits_system_back_out() {
        let req = ChatRequest::new(
            "claude-3-opus",
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
        );
        let body = build_payload(&req, "claude-3-opus");
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn top_k_lands_in_payload_and_extra_body() {
        let v = json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": "x"}],
            "top_k": 40,
            "top_p": 0.8,
        });
        let req = request_from_wire(&v).unwrap();
        assert_eq!(req.top_k, Some(40));
        assert_eq!(req.extra_body["top_k"], json!(40));
        let body = build_payload(&req, "claude-3-opus");
        assert_eq!(body["top_k"], json!(40));
        assert_eq!(body["top_p"], json!(0.8));
    }

    #[test]
    fn tool_use_block_becomes_tool_call() {
        let v = json!({
            "model": "claude-3-opus",
            "messages": [
                {"role": "user", "content": "list files"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "ls", "input": {"path": "."}},
                ]},
            ],
        });
        let req = request_from_wire(&v).unwrap();
        let assistant = &req.messages[1];
        assert_eq!(assistant.tool_calls.len(), 1);
        assert_eq!(assistant.tool_calls[0].function.name, "ls");
        let args: Value =
            serde_json::from_str(&assistant.tool_calls[0].function.arguments).unwrap();
        assert_eq!(args["path"], ".");
    }

    #[test]
    fn tool_result_block_becomes_tool_message() {
        let v = json!({
            "model": "claude-3-opus",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "a.txt"},
                ]},
            ],
        });
        let req = request_from_wire(&v).unwrap();
        assert_eq!(req.messages[0].role, Role::Tool);
        assert_eq!(req.messages[0].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(req.messages[0].as_text(), Some("a.txt"));
    }

    #[test]
    fn outbound_tool_result_uses_tool_result_block() {
        let req = ChatRequest::new(
            "claude-3-opus",
            vec![ChatMessage::tool_result("toolu_1", "done")],
        );
        let body = build_payload(&req, "claude-3-opus");
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "toolu_1");
        assert_eq!(block["content"], "done");
    }

    #[test]
    fn outbound_image_data_url_becomes_base64_source() {
        let req = ChatRequest::new(
            "claude-3-opus",
            vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::text("look"),
                    ContentPart::image("data:image/png;base64,iVBORw0KGgo="),
                ]),
                name: None,
                tool_call_id: None,
                tool_calls: Vec::new(),
            }],
        );
        let body = build_payload(&req, "claude-3-opus");
        let img = &body["messages"][0]["content"][1];
        assert_eq!(img["source"]["type"], "base64");
        assert_eq!(img["source"]["media_type"], "image/png");
        assert_eq!(img["source"]["data"], "iVBORw0KGgo=");
    }

    // ── Response conversion ───────────────────────────────────────────────────

    #[test]
    fn text_blocks_collapse_concatenatively() {
        let v = json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"},
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 2},
        });
        let out = response_to_openai(&v, "claude-3-opus");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 12);
    }

    #[test]
    fn tool_use_response_maps_to_tool_calls() {
        let v = json!({
            "id": "msg_2",
            "content": [
                {"type": "tool_use", "id": "toolu_9", "name": "grep", "input": {"q": "x"}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 5, "output_tokens": 3},
        });
        let out = response_to_openai(&v, "claude-3-opus");
        let message = &out["choices"][0]["message"];
        assert!(message["content"].is_null());
        assert_eq!(message["tool_calls"][0]["function"]["name"], "grep");
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn openai_response_converts_back_to_anthropic_shape() {
        let v = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi there"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6},
        });
        let out = response_from_openai(&v);
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "hi there");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 4);
    }

    #[test]
    fn openai_tool_calls_convert_to_tool_use_blocks() {
        let v = json!({
            "id": "chatcmpl-2",
            "model": "gpt-4",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "c1", "type": "function",
                        "function": {"name": "ls", "arguments": "{\"p\":\".\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1},
        });
        let out = response_from_openai(&v);
        assert_eq!(out["content"][0]["type"], "tool_use");
        assert_eq!(out["content"][0]["input"]["p"], ".");
        assert_eq!(out["stop_reason"], "tool_use");
    }
}
