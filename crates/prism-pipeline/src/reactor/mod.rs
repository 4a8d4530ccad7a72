// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call reactor.
//!
//! An observable, interceptable pipeline for tool calls found in LLM
//! responses.  Handlers register once at startup (unique by name) and are
//! dispatched in descending priority; the first handler that swallows a
//! call wins.  Handler failures are logged and never abort the chain.

pub mod dangerous;
pub mod pytest;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use prism_domain::ProxyError;

/// Context for one detected tool call.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub session_id: String,
    pub backend_name: String,
    pub model_name: String,
    /// The full (OpenAI-shape) response the call was found in.
    pub full_response: Value,
    pub tool_name: String,
    /// Parsed arguments when the JSON (after repair) parses; otherwise the
    /// raw argument string.
    pub tool_arguments: Value,
    pub calling_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What a handler decided to do with the call.
#[derive(Debug, Clone, Default)]
pub struct ToolCallReaction {
    /// Swallow the call and keep it from reaching the caller.
    pub should_swallow: bool,
    /// Steering text replacing the assistant message when swallowing.
    pub replacement_response: Option<String>,
    pub metadata: Option<Value>,
}

impl ToolCallReaction {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn swallow(replacement: impl Into<String>) -> Self {
        Self {
            should_swallow: true,
            replacement_response: Some(replacement.into()),
            metadata: None,
        }
    }
}

/// Optional per-handler rate limit, tracked per (session, handler).
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub calls_per_window: u32,
    pub window_seconds: u64,
}

#[async_trait]
pub trait ToolCallHandler: Send + Sync {
    /// Unique handler name; duplicate registration fails.
    fn name(&self) -> &'static str;

    /// Higher priorities run first.
    fn priority(&self) -> i32;

    fn rate_limit(&self) -> Option<RateLimit> {
        None
    }

    async fn can_handle(&self, ctx: &ToolCallContext) -> bool;

    async fn handle(&self, ctx: &ToolCallContext) -> Result<ToolCallReaction, ProxyError>;
}

// ─── History tracking ─────────────────────────────────────────────────────────

const MAX_HISTORY_PER_SESSION: usize = 1000;

#[derive(Debug, Clone)]
struct HistoryEntry {
    tool_name: String,
    timestamp: DateTime<Utc>,
}

/// Bounded per-session ring of observed tool calls.
#[derive(Default)]
pub struct ToolCallHistoryTracker {
    history: Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl ToolCallHistoryTracker {
    pub async fn record_tool_call(&self, session_id: &str, tool_name: &str, timestamp: DateTime<Utc>) {
        let mut history = self.history.lock().await;
        let ring = history.entry(session_id.to_string()).or_default();
        ring.push_back(HistoryEntry { tool_name: tool_name.to_string(), timestamp });
        while ring.len() > MAX_HISTORY_PER_SESSION {
            ring.pop_front();
        }
    }

    /// Count of calls to `tool_name` within the trailing window.
    pub async fn get_call_count(
        &self,
        session_id: &str,
        tool_name: &str,
        window_seconds: u64,
    ) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds as i64);
        let history = self.history.lock().await;
        history
            .get(session_id)
            .map(|ring| {
                ring.iter()
                    .filter(|e| e.tool_name == tool_name && e.timestamp >= cutoff)
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn clear(&self, session_id: Option<&str>) {
        let mut history = self.history.lock().await;
        match session_id {
            Some(id) => {
                history.remove(id);
            }
            None => history.clear(),
        }
    }
}

// ─── Reactor ──────────────────────────────────────────────────────────────────

pub struct ToolCallReactor {
    handlers: HashMap<String, Arc<dyn ToolCallHandler>>,
    history: ToolCallHistoryTracker,
    rate_usage: Mutex<HashMap<(String, String), VecDeque<DateTime<Utc>>>>,
}

impl Default for ToolCallReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallReactor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            history: ToolCallHistoryTracker::default(),
            rate_usage: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler.  Registration happens once at startup; a
    /// duplicate name is programmer error.
    pub fn register_handler(&mut self, handler: Arc<dyn ToolCallHandler>) -> Result<(), ProxyError> {
        let name = handler.name();
        if self.handlers.contains_key(name) {
            return Err(ProxyError::ToolCallReactor(format!(
                "handler with name '{name}' is already registered"
            )));
        }
        info!(handler = name, "registered tool call handler");
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn history(&self) -> &ToolCallHistoryTracker {
        &self.history
    }

    /// Dispatch one tool call through the registered handlers.
    ///
    /// Returns the reaction of the first handler that swallowed the call,
    /// or `None` when every handler passed.
    pub async fn process_tool_call(&self, ctx: &ToolCallContext) -> Option<ToolCallReaction> {
        self.history
            .record_tool_call(&ctx.session_id, &ctx.tool_name, ctx.timestamp)
            .await;

        let mut handlers: Vec<&Arc<dyn ToolCallHandler>> = self.handlers.values().collect();
        handlers.sort_by_key(|h| std::cmp::Reverse(h.priority()));

        for handler in handlers {
            if let Some(limit) = handler.rate_limit() {
                if self.rate_exceeded(&ctx.session_id, handler.name(), limit).await {
                    debug!(
                        handler = handler.name(),
                        session_id = %ctx.session_id,
                        "handler rate limit exceeded; skipping"
                    );
                    continue;
                }
            }
            if !handler.can_handle(ctx).await {
                continue;
            }
            self.record_rate_usage(&ctx.session_id, handler.name()).await;
            match handler.handle(ctx).await {
                Ok(reaction) if reaction.should_swallow => {
                    info!(
                        handler = handler.name(),
                        tool = %ctx.tool_name,
                        session_id = %ctx.session_id,
                        "handler swallowed tool call"
                    );
                    return Some(reaction);
                }
                Ok(_) => {}
                Err(err) => {
                    // A failing handler must not abort the chain.
                    error!(handler = handler.name(), error = %err, "tool call handler failed");
                }
            }
        }
        None
    }

    async fn rate_exceeded(&self, session_id: &str, handler: &str, limit: RateLimit) -> bool {
        let cutoff = Utc::now() - chrono::Duration::seconds(limit.window_seconds as i64);
        let mut usage = self.rate_usage.lock().await;
        let window = usage
            .entry((session_id.to_string(), handler.to_string()))
            .or_default();
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        window.len() >= limit.calls_per_window as usize
    }

    async fn record_rate_usage(&self, session_id: &str, handler: &str) {
        let mut usage = self.rate_usage.lock().await;
        usage
            .entry((session_id.to_string(), handler.to_string()))
            .or_default()
            .push_back(Utc::now());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(tool: &str) -> ToolCallContext {
        ToolCallContext {
            session_id: "s1".into(),
            backend_name: "openai".into(),
            model_name: "gpt-4".into(),
            full_response: json!({}),
            tool_name: tool.into(),
            tool_arguments: json!({}),
            calling_agent: None,
            timestamp: Utc::now(),
        }
    }

    struct FixedHandler {
        name: &'static str,
        priority: i32,
        swallow: bool,
        calls: AtomicUsize,
        fail: bool,
        limit: Option<RateLimit>,
    }

    impl FixedHandler {
        fn new(name: &'static str, priority: i32, swallow: bool) -> Self {
            Self { name, priority, swallow, calls: AtomicUsize::new(0), fail: false, limit: None }
        }
    }

    #[async_trait]
    impl ToolCallHandler for FixedHandler {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn rate_limit(&self) -> Option<RateLimit> {
            self.limit
        }
        async fn can_handle(&self, _ctx: &ToolCallContext) -> bool {
            true
        }
        async fn handle(&self, _ctx: &ToolCallContext) -> Result<ToolCallReaction, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProxyError::ToolCallReactor("boom".into()));
            }
            Ok(if self.swallow {
                ToolCallReaction::swallow(format!("{} swallowed", self.name))
            } else {
                ToolCallReaction::pass()
            })
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reactor = ToolCallReactor::new();
        reactor
            .register_handler(Arc::new(FixedHandler::new("h", 0, false)))
            .unwrap();
        let err = reactor
            .register_handler(Arc::new(FixedHandler::new("h", 1, false)))
            .unwrap_err();
        assert!(matches!(err, ProxyError::ToolCallReactor(_)));
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order_and_first_swallow_wins() {
        let mut reactor = ToolCallReactor::new();
        let low = Arc::new(FixedHandler::new("low", 10, true));
        let high = Arc::new(FixedHandler::new("high", 100, true));
        reactor.register_handler(low.clone()).unwrap();
        reactor.register_handler(high.clone()).unwrap();

        let reaction = reactor.process_tool_call(&ctx("bash")).await.unwrap();
        assert_eq!(reaction.replacement_response.as_deref(), Some("high swallowed"));
        assert_eq!(high.calls.load(Ordering::SeqCst), 1);
        assert_eq!(low.calls.load(Ordering::SeqCst), 0, "low must not run after swallow");
    }

    #[tokio::test]
    async fn non_swallowing_handlers_fall_through() {
        let mut reactor = ToolCallReactor::new();
        let observer = Arc::new(FixedHandler::new("observer", 100, false));
        let sink = Arc::new(FixedHandler::new("sink", 10, true));
        reactor.register_handler(observer.clone()).unwrap();
        reactor.register_handler(sink.clone()).unwrap();

        let reaction = reactor.process_tool_call(&ctx("bash")).await.unwrap();
        assert_eq!(reaction.replacement_response.as_deref(), Some("sink swallowed"));
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_does_not_abort_chain() {
        let mut reactor = ToolCallReactor::new();
        let mut broken = FixedHandler::new("broken", 100, true);
        broken.fail = true;
        let fallback = Arc::new(FixedHandler::new("fallback", 10, true));
        reactor.register_handler(Arc::new(broken)).unwrap();
        reactor.register_handler(fallback.clone()).unwrap();

        let reaction = reactor.process_tool_call(&ctx("bash")).await.unwrap();
        assert_eq!(reaction.replacement_response.as_deref(), Some("fallback swallowed"));
    }

    #[tokio::test]
    async fn no_swallow_returns_none() {
        let mut reactor = ToolCallReactor::new();
        reactor
            .register_handler(Arc::new(FixedHandler::new("observer", 0, false)))
            .unwrap();
        assert!(reactor.process_tool_call(&ctx("bash")).await.is_none());
    }

    #[tokio::test]
    async fn rate_limit_skips_handler_after_budget() {
        let mut reactor = ToolCallReactor::new();
        let mut limited = FixedHandler::new("limited", 100, true);
        limited.limit = Some(RateLimit { calls_per_window: 2, window_seconds: 3600 });
        let limited = Arc::new(limited);
        reactor.register_handler(limited.clone()).unwrap();

        assert!(reactor.process_tool_call(&ctx("bash")).await.is_some());
        assert!(reactor.process_tool_call(&ctx("bash")).await.is_some());
        // Third call within the window: the handler is skipped entirely.
        assert!(reactor.process_tool_call(&ctx("bash")).await.is_none());
        assert_eq!(limited.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn history_records_and_counts_calls() {
        let reactor = ToolCallReactor::new();
        let mut c = ctx("grep");
        for _ in 0..3 {
            c.timestamp = Utc::now();
            reactor.process_tool_call(&c).await;
        }
        assert_eq!(reactor.history().get_call_count("s1", "grep", 60).await, 3);
        assert_eq!(reactor.history().get_call_count("s1", "other", 60).await, 0);
        reactor.history().clear(Some("s1")).await;
        assert_eq!(reactor.history().get_call_count("s1", "grep", 60).await, 0);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let tracker = ToolCallHistoryTracker::default();
        for _ in 0..(MAX_HISTORY_PER_SESSION + 10) {
            tracker.record_tool_call("s1", "t", Utc::now()).await;
        }
        assert_eq!(
            tracker.get_call_count("s1", "t", 3600).await,
            MAX_HISTORY_PER_SESSION
        );
    }
}
