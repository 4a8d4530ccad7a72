// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming JSON repair middleware.
//!
//! Wraps the raw byte stream with the stateful repair processor when the
//! session config enables it.  Unary responses pass through untouched;
//! they were already parsed upstream.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;

use prism_domain::ByteStream;

use super::{ResponseContext, ResponseMiddleware};
use crate::repair::StreamingJsonRepairProcessor;

pub struct JsonRepairMiddleware {
    enabled: bool,
    buffer_cap_bytes: usize,
    strict_mode: bool,
    schema: Option<Value>,
}

impl JsonRepairMiddleware {
    pub fn new(
        enabled: bool,
        buffer_cap_bytes: usize,
        strict_mode: bool,
        schema: Option<Value>,
    ) -> Self {
        Self { enabled, buffer_cap_bytes, strict_mode, schema }
    }
}

enum WrapState {
    Streaming(ByteStream, StreamingJsonRepairProcessor),
    Flushed,
}

#[async_trait::async_trait]
impl ResponseMiddleware for JsonRepairMiddleware {
    fn name(&self) -> &'static str {
        "json_repair"
    }

    fn priority(&self) -> i32 {
        -5
    }

    fn wrap_stream(&self, stream: ByteStream, _ctx: &ResponseContext) -> ByteStream {
        if !self.enabled {
            return stream;
        }
        let processor = StreamingJsonRepairProcessor::new(
            self.buffer_cap_bytes,
            self.strict_mode,
            self.schema.clone(),
        );

        Box::pin(futures::stream::unfold(
            WrapState::Streaming(stream, processor),
            |state| async move {
                match state {
                    WrapState::Streaming(mut stream, mut processor) => loop {
                        match stream.next().await {
                            Some(Ok(bytes)) => {
                                let text = String::from_utf8_lossy(&bytes);
                                let emitted = processor.process_chunk(&text);
                                if emitted.is_empty() {
                                    // Everything buffered; pull more input.
                                    continue;
                                }
                                return Some((
                                    Ok(Bytes::from(emitted)),
                                    WrapState::Streaming(stream, processor),
                                ));
                            }
                            Some(Err(e)) => {
                                return Some((Err(e), WrapState::Streaming(stream, processor)));
                            }
                            None => {
                                let tail = processor.finish();
                                if tail.is_empty() {
                                    return None;
                                }
                                return Some((Ok(Bytes::from(tail)), WrapState::Flushed));
                            }
                        }
                    },
                    WrapState::Flushed => None,
                }
            },
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prism_domain::ProxyError;

    fn byte_stream(frames: Vec<&str>) -> ByteStream {
        let frames: Vec<Result<Bytes, ProxyError>> = frames
            .into_iter()
            .map(|f| Ok(Bytes::from(f.to_string())))
            .collect();
        Box::pin(futures::stream::iter(frames))
    }

    async fn collect(stream: ByteStream) -> String {
        let frames: Vec<_> = stream.collect().await;
        frames
            .into_iter()
            .map(|f| String::from_utf8_lossy(&f.unwrap()).to_string())
            .collect()
    }

    fn middleware(enabled: bool) -> JsonRepairMiddleware {
        JsonRepairMiddleware::new(enabled, 64 * 1024, false, None)
    }

    #[tokio::test]
    async fn split_object_is_repaired_across_frames() {
        let ctx = ResponseContext::new("s", "b", "m");
        let stream = byte_stream(vec![r#"pre {"a":1,"b":"#, "2", "}", "post"]);
        let out = collect(middleware(true).wrap_stream(stream, &ctx)).await;
        assert_eq!(out, r#"pre {"a":1,"b":2}post"#);
    }

    #[tokio::test]
    async fn malformed_object_is_fixed() {
        let ctx = ResponseContext::new("s", "b", "m");
        let stream = byte_stream(vec![r#"{'tool': 'grep',}"#]);
        let out = collect(middleware(true).wrap_stream(stream, &ctx)).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["tool"], "grep");
    }

    #[tokio::test]
    async fn pending_buffer_is_flushed_at_eof() {
        let ctx = ResponseContext::new("s", "b", "m");
        let stream = byte_stream(vec![r#"{"a":"#]);
        let out = collect(middleware(true).wrap_stream(stream, &ctx)).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["a"].is_null());
    }

    #[tokio::test]
    async fn disabled_wrapper_is_identity() {
        let ctx = ResponseContext::new("s", "b", "m");
        let stream = byte_stream(vec!["raw {malformed"]);
        let out = collect(middleware(false).wrap_stream(stream, &ctx)).await;
        assert_eq!(out, "raw {malformed");
    }

    #[tokio::test]
    async fn json_free_stream_is_untouched() {
        let ctx = ResponseContext::new("s", "b", "m");
        let stream = byte_stream(vec!["plain ", "text ", "only"]);
        let out = collect(middleware(true).wrap_stream(stream, &ctx)).await;
        assert_eq!(out, "plain text only");
    }
}
