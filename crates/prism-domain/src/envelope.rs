// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde_json::Value;

use crate::ProxyError;

/// Async stream of raw byte frames from an upstream connector.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// A complete (non-streaming) upstream response, already normalized to the
/// OpenAI chat-completion shape.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub content: Value,
    pub headers: HashMap<String, String>,
    pub status_code: u16,
    pub usage: Option<Value>,
    pub metadata: Option<Value>,
}

impl ResponseEnvelope {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            headers: HashMap::new(),
            status_code: 200,
            usage: None,
            metadata: None,
        }
    }
}

/// A streaming upstream response: raw byte frames forwarded downstream as
/// SSE.  Middlewares may wrap `content` but must propagate cancellation and
/// close the upstream connection on drop.
pub struct StreamingResponseEnvelope {
    pub content: ByteStream,
    pub media_type: String,
    pub headers: HashMap<String, String>,
}

impl StreamingResponseEnvelope {
    pub fn new(content: ByteStream) -> Self {
        Self {
            content,
            media_type: "text/event-stream".to_string(),
            headers: HashMap::new(),
        }
    }
}

/// What a connector hands back: one body or a stream of frames.
pub enum BackendResponse {
    Unary(ResponseEnvelope),
    Streaming(StreamingResponseEnvelope),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(env) => f.debug_tuple("Unary").field(env).finish(),
            Self::Streaming(_) => f.debug_tuple("Streaming").field(&"<stream>").finish(),
        }
    }
}

impl BackendResponse {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}
