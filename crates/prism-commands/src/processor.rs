// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message scanning and command application.
//!
//! The last message is examined first; the first message found to contain a
//! command is the only one processed in a turn.  Within that message the
//! parts are examined in order, and once a command executes the remaining
//! parts pass through unchanged.  The command's full textual span is removed
//! from the residual content.

use tracing::debug;

use prism_domain::{ChatMessage, ContentPart, MessageContent, Session};

use crate::parser::CommandParser;
use crate::registry::{CommandContext, CommandRegistry, CommandResult};

/// Outcome of scanning one turn's messages.
#[derive(Debug, Default)]
pub struct ProcessedCommands {
    pub executed: bool,
    pub results: Vec<CommandResult>,
}

/// Scan `messages` for a command, execute it against `session`, and strip
/// the matched span in place.
pub fn process_messages(
    parser: &CommandParser,
    registry: &CommandRegistry,
    messages: &mut [ChatMessage],
    session: &Session,
    ctx: &CommandContext,
) -> ProcessedCommands {
    for index in (0..messages.len()).rev() {
        if let Some(result) = process_message(parser, registry, &mut messages[index], session, ctx)
        {
            debug!(
                command = %result.name,
                success = result.success,
                message_index = index,
                "command processed"
            );
            return ProcessedCommands { executed: true, results: vec![result] };
        }
    }
    ProcessedCommands::default()
}

fn process_message(
    parser: &CommandParser,
    registry: &CommandRegistry,
    message: &mut ChatMessage,
    session: &Session,
    ctx: &CommandContext,
) -> Option<CommandResult> {
    match &mut message.content {
        MessageContent::Text(text) => {
            let (command, span) = parser.parse(text)?;
            let result = registry.execute(&command, session, ctx);
            text.replace_range(span, "");
            Some(result)
        }
        MessageContent::Parts(parts) => {
            for part in parts.iter_mut() {
                if let ContentPart::Text { text } = part {
                    if let Some((command, span)) = parser.parse(text) {
                        let result = registry.execute(&command, session, ctx);
                        text.replace_range(span, "");
                        return Some(result);
                    }
                }
            }
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
