// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-band command language.
//!
//! Prompts may carry directives like `!/model(name=gpt-4)`.  The parser
//! extracts them, the registry dispatches to a handler, and the handler
//! returns a result message plus (optionally) a new immutable session state.
//! Command failures never abort a turn; they are reported inline.

mod handlers;
mod parser;
mod processor;
mod registry;

pub use parser::{Command, CommandParser};
pub use processor::{process_messages, ProcessedCommands};
pub use registry::{
    CommandContext, CommandHandler, CommandRegistry, CommandResult,
};
