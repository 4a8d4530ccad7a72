// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Response middleware chain.
//!
//! Middlewares are ordered by declared priority; lower priorities run
//! later, so terminal steps (loop detection) come last.  Unary responses
//! flow through `process_unary`; streaming responses are wrapped by
//! `wrap_stream`, which must forward cancellation by closing the upstream
//! when the wrapped stream is dropped.

pub mod json_repair_mw;
pub mod loop_detection;
pub mod reactor_mw;
pub mod sse;

use std::sync::Arc;

use serde_json::Value;

use prism_domain::{ByteStream, LoopConfig};

/// Context for response-side middlewares.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub session_id: String,
    pub backend_name: String,
    pub model_name: String,
    pub calling_agent: Option<String>,
    pub loop_config: LoopConfig,
}

impl ResponseContext {
    pub fn new(session_id: impl Into<String>, backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            backend_name: backend.into(),
            model_name: model.into(),
            calling_agent: None,
            loop_config: LoopConfig::default(),
        }
    }
}

#[async_trait::async_trait]
pub trait ResponseMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower priorities run later.
    fn priority(&self) -> i32;

    async fn process_unary(&self, response: Value, _ctx: &ResponseContext) -> Value {
        response
    }

    fn wrap_stream(&self, stream: ByteStream, _ctx: &ResponseContext) -> ByteStream {
        stream
    }
}

/// Priority-ordered chain of response middlewares.
pub struct ResponsePipeline {
    middlewares: Vec<Arc<dyn ResponseMiddleware>>,
}

impl ResponsePipeline {
    pub fn new(mut middlewares: Vec<Arc<dyn ResponseMiddleware>>) -> Self {
        middlewares.sort_by_key(|m| std::cmp::Reverse(m.priority()));
        Self { middlewares }
    }

    pub async fn process_unary(&self, mut response: Value, ctx: &ResponseContext) -> Value {
        for middleware in &self.middlewares {
            response = middleware.process_unary(response, ctx).await;
        }
        response
    }

    pub fn wrap_stream(&self, mut stream: ByteStream, ctx: &ResponseContext) -> ByteStream {
        for middleware in &self.middlewares {
            stream = middleware.wrap_stream(stream, ctx);
        }
        stream
    }
}
