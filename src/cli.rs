// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Interactive multi-backend LLM proxy.
///
/// Accepts OpenAI, Anthropic, and Gemini format requests, applies
/// per-session commands and policy middleware, and forwards to the
/// configured upstream backends.  Without a subcommand the proxy serves
/// HTTP on the configured address.
#[derive(Parser, Debug)]
#[command(name = "prism", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered ones).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP proxy (the default when no subcommand is given).
    Serve {
        /// Listen port override.
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },

    /// Print the merged configuration and exit.
    ShowConfig,

    /// List registered backends and whether each is functional.
    ListBackends {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}
