// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Edit-precision tuning.
//!
//! Agent prompts that report a failed file edit (SEARCH/REPLACE mismatch,
//! multiple matches, diff-hunk failures) trigger a one-shot lowering of
//! sampling parameters for the current request only.  Original values are
//! recorded under `extra_body._edit_precision_meta`; nothing sticks to the
//! session.

use regex::Regex;
use serde_json::json;
use tracing::info;

use prism_config::EditPrecisionConfig;
use prism_domain::{ChatRequest, MessageContent, Role};

use super::{RequestMiddleware, RequestPipelineContext};

/// Prompts that indicate the previous edit attempt failed.
const DEFAULT_PATTERNS: &[&str] = &[
    r"(?is)search/replace block.{0,120}(?:not found|did not match|failed to match|no match)",
    r"(?is)no exact match found for search",
    r"(?i)multiple matches found",
    r"(?is)unified diff.{0,120}(?:failed|could not|malformed)",
    r"(?i)hunk\s+#?\d+\s+failed",
    r"(?is)failed to apply (?:the )?(?:diff|patch|edit)",
    r"(?is)apply_diff.{0,80}(?:failed|error)",
];

pub struct EditPrecisionMiddleware {
    config: EditPrecisionConfig,
    patterns: Vec<Regex>,
}

impl EditPrecisionMiddleware {
    pub fn new(config: EditPrecisionConfig) -> Self {
        let mut patterns: Vec<Regex> = DEFAULT_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        for extra in &config.extra_patterns {
            if let Ok(re) = Regex::new(extra) {
                patterns.push(re);
            }
        }
        Self { config, patterns }
    }

    fn matches(&self, text: &str) -> bool {
        !text.is_empty() && self.patterns.iter().any(|p| p.is_match(text))
    }

    /// Last user text first, then every text in the request.
    fn contains_edit_failure(&self, request: &ChatRequest) -> bool {
        if let Some(last) = request.last_user_text() {
            if self.matches(&last) {
                return true;
            }
        }
        request.messages.iter().any(|m| {
            m.role != Role::System
                && match &m.content {
                    MessageContent::Text(t) => self.matches(t),
                    MessageContent::Parts(_) => self.matches(&m.content.joined_text()),
                }
        })
    }

    fn compute_temperature(&self, current: Option<f64>, model: &str) -> f64 {
        let target = self.config.temperature_for_model(model);
        match current {
            None => target,
            // Already deterministic: raise to the target so a retry is not
            // forced down the identical path.
            Some(t) if t <= 0.0 => target,
            Some(t) => t.min(target),
        }
    }

    fn compute_top_p(&self, current: Option<f64>) -> Option<f64> {
        match (self.config.min_top_p, current) {
            (None, current) => current,
            (Some(floor), None) => Some(floor),
            (Some(floor), Some(p)) => Some(p.min(floor)),
        }
    }
}

impl RequestMiddleware for EditPrecisionMiddleware {
    fn name(&self) -> &'static str {
        "edit_precision"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn process(&self, mut request: ChatRequest, ctx: &mut RequestPipelineContext) -> ChatRequest {
        if !self.config.enabled || request.messages.is_empty() {
            return request;
        }
        if !self.contains_edit_failure(&request) {
            return request;
        }

        let new_temperature = self.compute_temperature(request.temperature, &request.model);
        let new_top_p = self.compute_top_p(request.top_p);

        info!(
            session_id = %ctx.session_id,
            temperature_from = ?request.temperature,
            temperature_to = new_temperature,
            top_p_from = ?request.top_p,
            top_p_to = ?new_top_p,
            "edit-precision overrides applied (one-shot)"
        );

        request
            .extra_body
            .entry("_edit_precision_mode".to_string())
            .or_insert(json!(true));
        request.extra_body.insert(
            "_edit_precision_meta".to_string(),
            json!({
                "original_temperature": request.temperature,
                "original_top_p": request.top_p,
                "applied_temperature": new_temperature,
                "applied_top_p": new_top_p,
            }),
        );
        request.temperature = Some(new_temperature);
        request.top_p = new_top_p;
        request
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
