// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Command recognition and argument extraction.
//!
//! A command is `PREFIX name` optionally followed by a balanced
//! parenthesized argument list.  The argument scanner tracks bracket depth
//! for `(`, `[`, `{` and string state for `"` / `'` (honoring backslash
//! escapes), so commas inside nested structures never split a value:
//! `!/set(pattern=(?P<n>[\w-]+), flag=yes)` yields two arguments with the
//! pattern text preserved verbatim.  Unterminated brackets or quotes yield
//! no command at all and the content passes through unchanged.

use regex::Regex;

/// A parsed command occurrence.
///
/// Arguments keep their declaration order (the `unset` command treats keys
/// positionally) and values keep their text verbatim.  A bare key maps to
/// the empty string.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<(String, String)>,
}

impl Command {
    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|(k, _)| k.as_str())
    }

    /// Render back to source form; `parse(render(cmd)) == cmd` for ASCII
    /// argument values.
    pub fn render(&self, prefix: &str) -> String {
        if self.args.is_empty() {
            return format!("{prefix}{}", self.name);
        }
        let args = self
            .args
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{prefix}{}({args})", self.name)
    }
}

/// Extracts commands embedded in message content.
pub struct CommandParser {
    prefix: String,
    name_pattern: Regex,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new("!/")
    }
}

impl CommandParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name_pattern: Regex::new(r"^[A-Za-z0-9_-]+").expect("static pattern"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Find the first command in `content`.
    ///
    /// Returns the command together with the byte range of its full textual
    /// span, so callers can remove exactly the matched text.
    pub fn parse(&self, content: &str) -> Option<(Command, std::ops::Range<usize>)> {
        let mut search_from = 0;
        while let Some(rel) = content[search_from..].find(&self.prefix) {
            let start = search_from + rel;
            let after_prefix = start + self.prefix.len();
            let Some(name_match) = self.name_pattern.find(&content[after_prefix..]) else {
                search_from = after_prefix;
                continue;
            };
            let name = name_match.as_str().to_string();
            let name_end = after_prefix + name_match.end();

            // Optional argument list.
            if content[name_end..].starts_with('(') {
                match scan_balanced_args(&content[name_end..]) {
                    Some((args_src, consumed)) => {
                        let args = split_args(&args_src);
                        return Some((Command { name, args }, start..name_end + consumed));
                    }
                    // Unterminated list: treat the whole content as plain text.
                    None => return None,
                }
            }
            return Some((Command { name, args: Vec::new() }, start..name_end));
        }
        None
    }
}

/// Scan a balanced `(...)` group starting at byte 0 of `s`.
///
/// Returns the inner argument text and the number of bytes consumed
/// (including both parentheses), or `None` when the group never closes.
fn scan_balanced_args(s: &str) -> Option<(String, usize)> {
    debug_assert!(s.starts_with('('));
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_string = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    if ch != ')' {
                        // Mismatched closer for the outer group.
                        return None;
                    }
                    return Some((s[1..i].to_string(), i + ch.len_utf8()));
                }
            }
            _ => {}
        }
    }
    None
}

/// Split an argument list at top-level commas into `key[=value]` pairs.
///
/// Only commas at bracket depth zero and outside strings separate
/// arguments; the `=` split likewise honors only the first depth-zero
/// occurrence so values keep their text verbatim.
fn split_args(src: &str) -> Vec<(String, String)> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for ch in src.chars() {
        if let Some(quote) = in_string {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                in_string = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);

    let mut args = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match split_key_value(part) {
            Some((key, value)) => args.push((key.trim().to_string(), value.trim().to_string())),
            None => args.push((part.to_string(), String::new())),
        }
    }
    args
}

/// Split `key=value` at the first `=` that sits at depth zero outside a
/// string.  Returns `None` for bare keys.
fn split_key_value(part: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in part.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_string = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => return Some((&part[..i], &part[i + 1..])),
            _ => {}
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
