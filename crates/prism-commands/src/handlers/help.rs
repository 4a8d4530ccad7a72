// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use prism_domain::Session;

use crate::parser::Command;
use crate::registry::{CommandContext, CommandHandler, CommandResult};

#[derive(Debug, Clone)]
pub struct HelpEntry {
    pub name: String,
    pub description: String,
    pub usage: String,
}

/// Renders help from a snapshot of the registry taken at startup.
pub struct HelpHandler {
    entries: Vec<HelpEntry>,
}

impl HelpHandler {
    pub fn new(entries: Vec<HelpEntry>) -> Self {
        Self { entries }
    }

    fn find(&self, name: &str) -> Option<&HelpEntry> {
        let name = name.to_lowercase();
        self.entries.iter().find(|e| e.name == name)
    }
}

impl CommandHandler for HelpHandler {
    fn name(&self) -> &'static str {
        "help"
    }

    fn description(&self) -> &'static str {
        "Display help information for available commands"
    }

    fn usage(&self) -> String {
        "help(command=command-name)".to_string()
    }

    fn execute(&self, cmd: &Command, _session: &Session, _ctx: &CommandContext) -> CommandResult {
        // Accept both help(command=set) and the bare form help(set).
        let target = cmd
            .get("command")
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| cmd.args.first().map(|(k, _)| k.clone()));

        match target {
            Some(name) => match self.find(&name) {
                Some(entry) => CommandResult::ok(
                    self.name(),
                    format!(
                        "Help for {}: {}\nUsage: {}",
                        entry.name, entry.description, entry.usage
                    ),
                ),
                None => CommandResult::fail(self.name(), format!("Command {name} not found")),
            },
            None => {
                let mut names: Vec<&str> =
                    self.entries.iter().map(|e| e.name.as_str()).collect();
                names.sort_unstable();
                CommandResult::ok(
                    self.name(),
                    format!(
                        "Available commands:\n{}\n\nUse help(command=command-name) for detailed help on a specific command.",
                        names.join(", ")
                    ),
                )
            }
        }
    }
}
