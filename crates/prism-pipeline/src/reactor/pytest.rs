// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pytest-related tool-call handlers.
//!
//! The compression detector watches for pytest invocations and flags the
//! session so the next tool-call reply can be compressed; it never swallows
//! the call.  The full-suite steering handler swallows the *first*
//! unselective pytest run per session and lets an identical re-issue within
//! the TTL pass through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::info;

use prism_domain::ProxyError;
use prism_session::SessionService;

use super::dangerous::extract_command_string;
use super::{ToolCallContext, ToolCallHandler, ToolCallReaction};

pub const FULL_SUITE_STEERING_MESSAGE: &str = "You requested to run the whole test suite. This may be a lengthy process. \
     Please consider running only selected tests for optimal speed. If you still \
     believe you need to run the whole test suite, please re-send your tool call \
     and it will be executed.";

fn pytest_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(pytest|py\.test)(?:\b|\.py\b)").expect("static pattern"))
}

const SHELL_TOOLS: &[&str] = &[
    "bash",
    "exec_command",
    "execute_command",
    "run_shell_command",
    "shell",
    "local_shell",
    "container.exec",
];

fn normalize_whitespace(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pull a pytest command out of the tool call, honoring both shell tools
/// and providers that map pytest directly as the function name.
fn extract_pytest_command(ctx: &ToolCallContext) -> Option<String> {
    if SHELL_TOOLS.contains(&ctx.tool_name.as_str()) {
        let command = extract_command_string(&ctx.tool_arguments)?;
        pytest_pattern().is_match(&command).then_some(command)
    } else if pytest_pattern().is_match(&ctx.tool_name) {
        Some(
            extract_command_string(&ctx.tool_arguments)
                .unwrap_or_else(|| ctx.tool_name.clone()),
        )
    } else {
        None
    }
}

/// Whether the pytest command targets the entire suite: no positional
/// argument selects a file (path separators, `.py` suffix), a node
/// (`::` syntax), or the current directory.
fn looks_like_full_suite(command: &str) -> bool {
    let normalized = normalize_whitespace(command);
    if !pytest_pattern().is_match(&normalized) {
        return false;
    }
    let tokens: Vec<&str> = normalized.split(' ').collect();
    let Some(pytest_index) = tokens.iter().position(|t| pytest_pattern().is_match(t)) else {
        return false;
    };

    for token in &tokens[pytest_index + 1..] {
        if token.is_empty() || token.starts_with('-') {
            continue;
        }
        let stripped = token.trim_matches(',');
        if stripped.contains("::") {
            return false;
        }
        if stripped.contains('/')
            || stripped.contains('\\')
            || stripped.ends_with(".py")
            || stripped.ends_with(".pyi")
        {
            return false;
        }
        if stripped == "." {
            return false;
        }
    }
    true
}

// ─── Compression detector ─────────────────────────────────────────────────────

/// Flags the session for tool-reply compression when a pytest command is
/// seen.  The call itself is never swallowed.
pub struct PytestCompressionHandler {
    sessions: Arc<SessionService>,
}

impl PytestCompressionHandler {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ToolCallHandler for PytestCompressionHandler {
    fn name(&self) -> &'static str {
        "pytest_compression_handler"
    }

    /// Below the dangerous-command handler, above generic steering.
    fn priority(&self) -> i32 {
        90
    }

    async fn can_handle(&self, ctx: &ToolCallContext) -> bool {
        extract_pytest_command(ctx).is_some()
    }

    async fn handle(&self, ctx: &ToolCallContext) -> Result<ToolCallReaction, ProxyError> {
        let Some(command) = extract_pytest_command(ctx) else {
            return Ok(ToolCallReaction::pass());
        };
        info!(
            session_id = %ctx.session_id,
            command = %command,
            "pytest command detected; flagging next tool reply for compression"
        );
        {
            let mut session = self.sessions.lock_session(&ctx.session_id).await;
            let state = session.state.with_compress_next_tool_call_reply(true);
            session.update_state(state);
        }
        let mut reaction = ToolCallReaction::pass();
        reaction.metadata = Some(serde_json::json!({
            "handler": self.name(),
            "detected_pytest": true,
            "command": command,
            "compression_state_set": true,
            "source": "pytest_compression_detector",
        }));
        Ok(reaction)
    }
}

// ─── Full-suite steering ──────────────────────────────────────────────────────

struct SuiteAttempt {
    command: String,
    at: DateTime<Utc>,
}

/// Swallows the first full-suite pytest run per session; an identical
/// re-issue within the TTL passes through.
pub struct PytestFullSuiteHandler {
    message: String,
    ttl_seconds: u64,
    attempts: Mutex<HashMap<String, SuiteAttempt>>,
}

impl PytestFullSuiteHandler {
    pub fn new(message: Option<String>, ttl_seconds: u64) -> Self {
        Self {
            message: message.unwrap_or_else(|| FULL_SUITE_STEERING_MESSAGE.to_string()),
            ttl_seconds,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    async fn is_reissue(&self, session_id: &str, normalized: &str) -> bool {
        let attempts = self.attempts.lock().await;
        attempts.get(session_id).is_some_and(|attempt| {
            attempt.command == normalized
                && (Utc::now() - attempt.at).num_seconds() <= self.ttl_seconds as i64
        })
    }
}

#[async_trait]
impl ToolCallHandler for PytestFullSuiteHandler {
    fn name(&self) -> &'static str {
        "pytest_full_suite_handler"
    }

    /// Higher than generic steering, below the dangerous-command handler.
    fn priority(&self) -> i32 {
        95
    }

    async fn can_handle(&self, ctx: &ToolCallContext) -> bool {
        let Some(command) = extract_pytest_command(ctx) else {
            return false;
        };
        let normalized = normalize_whitespace(&command);
        if !looks_like_full_suite(&normalized) {
            return false;
        }
        !self.is_reissue(&ctx.session_id, &normalized).await
    }

    async fn handle(&self, ctx: &ToolCallContext) -> Result<ToolCallReaction, ProxyError> {
        let Some(command) = extract_pytest_command(ctx) else {
            return Ok(ToolCallReaction::pass());
        };
        let normalized = normalize_whitespace(&command);
        if !looks_like_full_suite(&normalized) || self.is_reissue(&ctx.session_id, &normalized).await
        {
            return Ok(ToolCallReaction::pass());
        }

        self.attempts.lock().await.insert(
            ctx.session_id.clone(),
            SuiteAttempt { command: normalized.clone(), at: Utc::now() },
        );

        info!(
            session_id = %ctx.session_id,
            command = %normalized,
            "steering full-suite pytest command"
        );
        let mut reaction = ToolCallReaction::swallow(self.message.clone());
        reaction.metadata = Some(serde_json::json!({
            "handler": self.name(),
            "tool_name": ctx.tool_name,
            "command": normalized,
            "source": "pytest_full_suite_steering",
        }));
        Ok(reaction)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tool: &str, args: serde_json::Value) -> ToolCallContext {
        ToolCallContext {
            session_id: "s1".into(),
            backend_name: "openai".into(),
            model_name: "gpt-4".into(),
            full_response: json!({}),
            tool_name: tool.into(),
            tool_arguments: args,
            calling_agent: None,
            timestamp: Utc::now(),
        }
    }

    // ── Full-suite heuristic ──────────────────────────────────────────────────

    #[test]
    fn plain_pytest_is_full_suite() {
        assert!(looks_like_full_suite("pytest"));
        assert!(looks_like_full_suite("python -m pytest"));
        assert!(looks_like_full_suite("py.test -q"));
    }

    #[test]
    fn flags_do_not_make_it_selective() {
        assert!(looks_like_full_suite("pytest -x --maxfail=1 -q"));
    }

    #[test]
    fn file_and_node_selectors_are_selective() {
        assert!(!looks_like_full_suite("pytest tests/test_foo.py"));
        assert!(!looks_like_full_suite("pytest tests/test_foo.py::test_bar"));
        assert!(!looks_like_full_suite("pytest src/module"));
        assert!(!looks_like_full_suite("pytest ."));
    }

    #[test]
    fn non_pytest_commands_are_not_full_suite() {
        assert!(!looks_like_full_suite("cargo test"));
        assert!(!looks_like_full_suite("ls -la"));
    }

    // ── Compression detector ──────────────────────────────────────────────────

    #[tokio::test]
    async fn compression_handler_flags_session_without_swallowing() {
        let sessions = Arc::new(SessionService::new(3600));
        sessions.get_session("s1").await;
        let handler = PytestCompressionHandler::new(Arc::clone(&sessions));

        let c = ctx("bash", json!({"command": "pytest -q"}));
        assert!(handler.can_handle(&c).await);
        let reaction = handler.handle(&c).await.unwrap();
        assert!(!reaction.should_swallow);
        assert!(sessions.get_session("s1").await.state.compress_next_tool_call_reply);
    }

    #[tokio::test]
    async fn compression_handler_ignores_other_commands() {
        let sessions = Arc::new(SessionService::new(3600));
        let handler = PytestCompressionHandler::new(sessions);
        let c = ctx("bash", json!({"command": "cargo test"}));
        assert!(!handler.can_handle(&c).await);
    }

    // ── Full-suite steering ───────────────────────────────────────────────────

    #[tokio::test]
    async fn first_full_suite_run_is_swallowed() {
        let handler = PytestFullSuiteHandler::new(None, 600);
        let c = ctx("execute_command", json!({"command": "pytest"}));
        assert!(handler.can_handle(&c).await);
        let reaction = handler.handle(&c).await.unwrap();
        assert!(reaction.should_swallow);
        assert!(reaction
            .replacement_response
            .as_deref()
            .unwrap()
            .contains("whole test suite"));
    }

    #[tokio::test]
    async fn identical_reissue_passes_through() {
        let handler = PytestFullSuiteHandler::new(None, 600);
        let c = ctx("execute_command", json!({"command": "pytest"}));
        handler.handle(&c).await.unwrap();
        // Same command re-issued: can_handle now declines.
        assert!(!handler.can_handle(&c).await);
    }

    #[tokio::test]
    async fn different_full_suite_command_is_swallowed_again() {
        let handler = PytestFullSuiteHandler::new(None, 600);
        let first = ctx("execute_command", json!({"command": "pytest"}));
        handler.handle(&first).await.unwrap();
        let second = ctx("execute_command", json!({"command": "python -m pytest"}));
        assert!(handler.can_handle(&second).await);
    }

    #[tokio::test]
    async fn selective_run_is_never_steered() {
        let handler = PytestFullSuiteHandler::new(None, 600);
        let c = ctx("bash", json!({"command": "pytest tests/test_api.py -q"}));
        assert!(!handler.can_handle(&c).await);
    }

    #[tokio::test]
    async fn sessions_are_tracked_independently() {
        let handler = PytestFullSuiteHandler::new(None, 600);
        let a = ctx("bash", json!({"command": "pytest"}));
        handler.handle(&a).await.unwrap();
        let mut b = ctx("bash", json!({"command": "pytest"}));
        b.session_id = "s2".into();
        assert!(handler.can_handle(&b).await);
    }
}
