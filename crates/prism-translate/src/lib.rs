// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire-format translation.
//!
//! Each module converts between the canonical [`prism_domain`] chat model
//! and one provider's wire format, in both directions, for unary and
//! streaming responses.  Every translation is pure; text and tool-call
//! content round-trips exactly, multimodal images are preserved only in the
//! provider-native direction.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use serde_json::Value;

use prism_domain::{ContentPart, MessageContent};

/// Merge `extra_body` into `payload`, skipping reserved `_`-prefixed keys.
/// Extra-body values override anything already present.
pub(crate) fn merge_extra_body(
    payload: &mut Value,
    extra_body: &serde_json::Map<String, Value>,
) {
    for (key, value) in extra_body {
        if key.starts_with('_') {
            continue;
        }
        payload[key] = value.clone();
    }
}

/// Collapse a single text part to plain text for cleaner serialization;
/// anything else stays a parts list.
pub(crate) fn collapse_parts(mut parts: Vec<ContentPart>) -> MessageContent {
    if parts.len() == 1 {
        match parts.pop() {
            Some(ContentPart::Text { text }) => MessageContent::Text(text),
            Some(other) => MessageContent::Parts(vec![other]),
            None => MessageContent::Text(String::new()),
        }
    } else {
        MessageContent::Parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internal_keys_are_stripped_on_merge() {
        let mut payload = json!({"model": "m"});
        let mut extra = serde_json::Map::new();
        extra.insert("_edit_precision_mode".into(), json!(true));
        extra.insert("seed".into(), json!(7));
        merge_extra_body(&mut payload, &extra);
        assert!(payload.get("_edit_precision_mode").is_none());
        assert_eq!(payload["seed"], json!(7));
    }

    #[test]
    fn extra_body_overrides_existing_keys() {
        let mut payload = json!({"temperature": 0.5});
        let mut extra = serde_json::Map::new();
        extra.insert("temperature".into(), json!(0.9));
        merge_extra_body(&mut payload, &extra);
        assert_eq!(payload["temperature"], json!(0.9));
    }
}
