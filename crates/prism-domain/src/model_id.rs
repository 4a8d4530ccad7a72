// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model identifier parsing.
//!
//! Users write `backend:model` or `backend/model`; the colon form wins when
//! both separators appear because model names themselves may contain `/`
//! (e.g. `openrouter:mistralai/mixtral-8x7b`).

/// Split a combined model spec into `(backend, model)`.
///
/// Returns `None` when no separator is present or either side is empty
/// after trimming.
pub fn parse_model_backend(spec: &str) -> Option<(String, String)> {
    let (backend, model) = if let Some((b, m)) = spec.split_once(':') {
        (b, m)
    } else {
        spec.split_once('/')?
    };
    let backend = backend.trim();
    let model = model.trim();
    if backend.is_empty() || model.is_empty() {
        return None;
    }
    Some((backend.to_string(), model.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_form_splits() {
        assert_eq!(
            parse_model_backend("openai:gpt-4"),
            Some(("openai".into(), "gpt-4".into()))
        );
    }

    #[test]
    fn slash_form_splits() {
        assert_eq!(
            parse_model_backend("gemini/gemini-pro"),
            Some(("gemini".into(), "gemini-pro".into()))
        );
    }

    #[test]
    fn colon_wins_over_slash() {
        assert_eq!(
            parse_model_backend("openrouter:mistralai/mixtral-8x7b"),
            Some(("openrouter".into(), "mistralai/mixtral-8x7b".into()))
        );
    }

    #[test]
    fn bare_model_yields_none() {
        assert_eq!(parse_model_backend("gpt-4"), None);
    }

    #[test]
    fn empty_sides_yield_none() {
        assert_eq!(parse_model_backend(":gpt-4"), None);
        assert_eq!(parse_model_backend("openai:"), None);
        assert_eq!(parse_model_backend("/"), None);
    }

    #[test]
    fn whitespace_is_trimmed() {
        assert_eq!(
            parse_model_backend(" openai : gpt-4 "),
            Some(("openai".into(), "gpt-4".into()))
        );
    }
}
