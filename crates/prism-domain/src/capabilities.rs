// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Advisory per-model metadata.
//!
//! Clients may consult these descriptors (e.g. for display or budgeting);
//! the request pipeline itself never reads them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub tokens_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
    /// USD per million input tokens.
    #[serde(default)]
    pub input_price_per_mtok: Option<f64>,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_price_per_mtok: Option<f64>,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_streaming: bool,
}

impl ModelCapabilities {
    /// Conservative defaults for a model nothing is known about.
    pub fn unknown() -> Self {
        Self { supports_streaming: true, ..Default::default() }
    }
}
