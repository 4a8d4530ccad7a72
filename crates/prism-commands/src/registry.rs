// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Command registry: name → handler dispatch.
//!
//! Lookup is case-insensitive and alias-aware.  Handlers are pure: they
//! take the parsed arguments and the current session and return a result
//! message plus, when state changed, a new [`SessionState`] value.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use prism_domain::{Session, SessionState};

use crate::handlers;
use crate::parser::Command;

/// Outcome of one command execution.
///
/// `success = false` is an inline report, never an error that aborts the
/// turn.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub name: String,
    pub success: bool,
    pub message: String,
    pub new_state: Option<SessionState>,
    pub data: Option<Value>,
}

impl CommandResult {
    pub fn ok(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            message: message.into(),
            new_state: None,
            data: None,
        }
    }

    pub fn ok_with_state(name: &str, message: impl Into<String>, state: SessionState) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            message: message.into(),
            new_state: Some(state),
            data: None,
        }
    }

    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            message: message.into(),
            new_state: None,
            data: None,
        }
    }
}

/// Backend knowledge a handler may consult.  Handlers never perform I/O;
/// everything they need arrives through this context.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Every backend name known to the connector registry.
    pub registered_backends: Vec<String>,
    /// Subset of backends that passed initialization.
    pub functional_backends: Vec<String>,
}

impl CommandContext {
    pub fn is_registered(&self, backend: &str) -> bool {
        self.registered_backends.iter().any(|b| b == backend)
    }

    pub fn is_functional(&self, backend: &str) -> bool {
        self.functional_backends.iter().any(|b| b == backend)
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn description(&self) -> &'static str;

    fn usage(&self) -> String {
        format!("{}([param1=value1, param2=value2, ...])", self.name())
    }

    fn execute(&self, cmd: &Command, session: &Session, ctx: &CommandContext) -> CommandResult;
}

/// Registry mapping lowercased command names (and aliases) to handlers.
pub struct CommandRegistry {
    table: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// Build a registry containing every built-in handler.
    pub fn with_builtins() -> Self {
        let mut registry = Self { table: HashMap::new() };
        for handler in handlers::builtin_handlers() {
            registry.register(handler);
        }
        // The help handler needs the table contents; give it a snapshot of
        // what has been registered so far, plus itself.
        let mut entries = registry.help_entries();
        entries.push(handlers::help::HelpEntry {
            name: "help".to_string(),
            description: "Display help information for available commands".to_string(),
            usage: "help(command=command-name)".to_string(),
        });
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        registry.register(Arc::new(handlers::help::HelpHandler::new(entries)));
        registry
    }

    /// Register a handler under its name and aliases.  Last registration
    /// wins; registration happens once at startup.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        for alias in handler.aliases() {
            self.table.insert(alias.to_lowercase(), handler.clone());
        }
        self.table.insert(handler.name().to_lowercase(), handler);
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.table.get(&name.to_lowercase())
    }

    /// Canonical (non-alias) handler names, sorted.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .iter()
            .filter(|(key, handler)| key.as_str() == handler.name())
            .map(|(key, _)| key.clone())
            .collect();
        names.sort();
        names
    }

    fn help_entries(&self) -> Vec<handlers::help::HelpEntry> {
        let mut entries: Vec<handlers::help::HelpEntry> = self
            .table
            .iter()
            .filter(|(key, handler)| key.as_str() == handler.name())
            .map(|(_, handler)| handlers::help::HelpEntry {
                name: handler.name().to_string(),
                description: handler.description().to_string(),
                usage: handler.usage(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Dispatch a parsed command.  Unknown names yield a failed result, not
    /// an error.
    pub fn execute(&self, cmd: &Command, session: &Session, ctx: &CommandContext) -> CommandResult {
        match self.lookup(&cmd.name) {
            Some(handler) => {
                debug!(command = %cmd.name, "executing command");
                handler.execute(cmd, session, ctx)
            }
            None => CommandResult::fail(&cmd.name, format!("Unknown command: {}", cmd.name)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
