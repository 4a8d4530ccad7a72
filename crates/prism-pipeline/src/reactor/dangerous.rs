// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Dangerous shell-command enforcement.
//!
//! Tool calls naming a local shell execution tool are scanned against an
//! ordered list of regex rules covering destructive git operations.  A
//! match swallows the call and replaces the assistant message with a
//! steering response telling the model not to retry.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use prism_domain::ProxyError;

use super::{ToolCallContext, ToolCallHandler, ToolCallReaction};

pub const DEFAULT_STEERING_MESSAGE: &str = "This is the prism security enforcement module working on behalf of the \
     user in charge. Your latest tool call has been intercepted and not forwarded \
     to the agent. You were trying to execute a potentially dangerous command. \
     This proxy won't pass any further potentially harmful tool calls to the agent, \
     so don't try to repeat the latest call. Your only option if you want the given \
     command to be executed is to inform the user that they need to execute such a \
     command on their own. You must also warn the user about the potential destructive \
     consequences of running such a command. Such information WILL get passed back to the user.";

#[derive(Debug, Clone)]
pub struct DangerousCommandRule {
    pub pattern: Regex,
    pub name: &'static str,
}

fn rule(pattern: &str, name: &'static str) -> DangerousCommandRule {
    DangerousCommandRule {
        pattern: Regex::new(pattern).expect("static dangerous-command pattern"),
        name,
    }
}

/// Ordered rule list; more specific rules come before generic ones.
pub fn default_rules() -> Vec<DangerousCommandRule> {
    vec![
        // Commands that discard local changes or files.
        rule(r"git\s+reset\s+--hard(?:\s+\S+)?", "git-reset-hard"),
        rule(
            r"git\s+submodule\s+foreach\s+.*git\s+clean\s+.*-f.*",
            "git-submodule-foreach-clean-force",
        ),
        rule(
            r"^(?:.*\bgit\s+clean\b)(?:.*\s-[^\s]*f[^\s]*).*$",
            "git-clean-force",
        ),
        rule(
            r"git\s+restore\s+--worktree(?:\s+--staged)?\s+(?:--source=\S+\s+)?(?:\.\.|:/$|--pathspec-from-file|\.)",
            "git-restore-worktree",
        ),
        rule(r"git\s+checkout\s+--\s*(?:\.|:/$)", "git-checkout-destructive"),
        rule(r"git\s+(?:switch|checkout)\s+-f(?:\s|$)", "git-switch-checkout-force"),
        rule(r"git\s+checkout\s+--orphan\s+\S+", "git-checkout-orphan"),
        rule(r"git\s+rm\b.*--force(?:\s|$)", "git-rm-force"),
        // History rewriting.
        rule(
            r"git\s+rebase(?:\s+-i|\s+--interactive|\s+--rebase-merges|\s|$)",
            "git-rebase",
        ),
        rule(r"git\s+commit\s+--amend(?:\s|$)", "git-commit-amend"),
        rule(r"git\s+filter-branch(?:\s|$)", "git-filter-branch"),
        rule(r"git\s+filter-repo(?:\s|$)", "git-filter-repo"),
        rule(r"git\s+replace\s+", "git-replace"),
        // Remote operations.
        rule(r"git\s+push\s+(?:-f|--force)(?:\s|$)", "git-push-force"),
        rule(
            r"git\s+push\s+--force-with-lease(?:\S*)?(?:\s|$)",
            "git-push-force-with-lease",
        ),
        rule(r"git\s+push\s+(?:--delete|-d)\s+\S+", "git-push-delete-branch"),
        rule(r"git\s+push\s+\S+\s+:\S+", "git-push-delete-ref-legacy"),
        rule(r"git\s+push\s+--mirror(?:\s|$)", "git-push-mirror"),
        // Local reference deletions.
        rule(r"git\s+branch\s+-D\s+\S+", "git-branch-force-delete"),
        rule(r"git\s+branch\s+-d\s+\S+", "git-branch-delete"),
        rule(r"git\s+tag\s+-d\s+\S+", "git-tag-delete"),
        rule(r"git\s+update-ref\s+-d\s+\S+", "git-update-ref-delete"),
        rule(
            r"git\s+reflog\s+expire\s+--expire=now\s+--all",
            "git-reflog-expire-now",
        ),
        // Pruning and GC.
        rule(r"git\s+gc\s+--prune=now(?:\s|$)", "git-gc-prune-now"),
        rule(r"git\s+prune(?:\s|$)", "git-prune"),
        rule(r"git\s+repack\s+-d(?:\s|$)", "git-repack-delete"),
        rule(r"git\s+lfs\s+prune(?:\s|$)", "git-lfs-prune"),
        // Worktrees and submodules.
        rule(
            r"git\s+worktree\s+remove\s+--force\s+\S+",
            "git-worktree-remove-force",
        ),
        rule(r"git\s+worktree\s+prune(?:\s|$)", "git-worktree-prune"),
        rule(r"git\s+submodule\s+deinit\s+-f(?:\s|$)", "git-submodule-deinit-force"),
    ]
}

/// Scans tool calls for dangerous shell commands.
pub struct DangerousCommandScanner {
    tool_names: Vec<String>,
    rules: Vec<DangerousCommandRule>,
}

impl DangerousCommandScanner {
    pub fn new(tool_names: Vec<String>) -> Self {
        Self { tool_names, rules: default_rules() }
    }

    pub fn is_shell_tool(&self, tool_name: &str) -> bool {
        self.tool_names.iter().any(|t| t == tool_name)
    }

    /// Matched rule name and the reconstructed command string, or `None`.
    pub fn scan(&self, tool_name: &str, arguments: &Value) -> Option<(&'static str, String)> {
        if !self.is_shell_tool(tool_name) {
            return None;
        }
        let command = extract_command_string(arguments)?;
        // The regex crate has no lookaround, so the exceptions the rule
        // descriptions carve out are handled here: git clean is blocked only
        // without a dry-run flag, and git rm only when it removes files from
        // disk (no --cached).
        for rule in &self.rules {
            if rule.name == "git-clean-force"
                && (command.contains("--dry-run") || command.split_whitespace().any(|t| t == "-n"))
            {
                continue;
            }
            if rule.name == "git-rm-force" && command.contains("--cached") {
                continue;
            }
            if rule.pattern.is_match(&command) {
                return Some((rule.name, command));
            }
        }
        None
    }
}

/// Extract a shell command string from tool arguments.
///
/// Accepts a raw string (JSON text tried first), an object with
/// `command` / `cmd`, the same nested under `input` / `body` / `data`,
/// or an `args` list joined with spaces.
pub fn extract_command_string(arguments: &Value) -> Option<String> {
    let arguments = match arguments {
        Value::String(s) => {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed) => return extract_command_string(&parsed),
                Err(_) => return Some(s.clone()),
            }
        }
        other => other,
    };

    if let Some(obj) = arguments.as_object() {
        for key in ["command", "cmd"] {
            if let Some(cmd) = obj.get(key).and_then(Value::as_str) {
                if !cmd.trim().is_empty() {
                    return Some(cmd.to_string());
                }
            }
        }
        for key in ["input", "body", "data"] {
            if let Some(inner) = obj.get(key).and_then(Value::as_object) {
                for sub in ["command", "cmd"] {
                    if let Some(cmd) = inner.get(sub).and_then(Value::as_str) {
                        if !cmd.trim().is_empty() {
                            return Some(cmd.to_string());
                        }
                    }
                }
            }
        }
        if let Some(args) = obj.get("args").and_then(Value::as_array) {
            if !args.is_empty() {
                return Some(
                    args.iter()
                        .map(|a| match a {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" "),
                );
            }
        }
        return None;
    }

    if let Some(list) = arguments.as_array() {
        return Some(
            list.iter()
                .map(|a| match a {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        );
    }
    None
}

/// Handler that blocks dangerous git-related local execution tool calls.
pub struct DangerousCommandHandler {
    scanner: Arc<DangerousCommandScanner>,
    steering_message: String,
}

impl DangerousCommandHandler {
    pub fn new(scanner: Arc<DangerousCommandScanner>, steering_message: Option<String>) -> Self {
        Self {
            scanner,
            steering_message: steering_message
                .unwrap_or_else(|| DEFAULT_STEERING_MESSAGE.to_string()),
        }
    }
}

#[async_trait]
impl ToolCallHandler for DangerousCommandHandler {
    fn name(&self) -> &'static str {
        "dangerous_command_handler"
    }

    /// High priority so it runs before the generic handlers.
    fn priority(&self) -> i32 {
        100
    }

    async fn can_handle(&self, ctx: &ToolCallContext) -> bool {
        self.scanner.scan(&ctx.tool_name, &ctx.tool_arguments).is_some()
    }

    async fn handle(&self, ctx: &ToolCallContext) -> Result<ToolCallReaction, ProxyError> {
        let Some((rule, command)) = self.scanner.scan(&ctx.tool_name, &ctx.tool_arguments) else {
            return Ok(ToolCallReaction::pass());
        };
        warn!(
            rule,
            command = %command,
            session_id = %ctx.session_id,
            "intercepted a potentially dangerous command"
        );
        let mut reaction = ToolCallReaction::swallow(self.steering_message.clone());
        reaction.metadata = Some(serde_json::json!({
            "handler": self.name(),
            "rule": rule,
            "command": command,
            "tool_name": ctx.tool_name,
            "source": "dangerous_command_reactor",
        }));
        Ok(reaction)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
