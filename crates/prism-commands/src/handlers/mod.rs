// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in command handlers.

use std::sync::Arc;

use crate::parser::Command;
use crate::registry::CommandHandler;

mod failover;
pub(crate) mod help;
mod loops;
mod model;
mod session_cmds;
mod set;

/// Every built-in handler except `help`, which the registry constructs last
/// with a snapshot of the registered names.
pub(crate) fn builtin_handlers() -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(set::SetHandler),
        Arc::new(set::UnsetHandler),
        Arc::new(model::ModelHandler),
        Arc::new(model::BackendHandler),
        Arc::new(model::OpenAiUrlHandler),
        Arc::new(model::TemperatureHandler),
        Arc::new(model::OneoffHandler),
        Arc::new(session_cmds::HelloHandler),
        Arc::new(session_cmds::PwdHandler),
        Arc::new(loops::LoopDetectionHandler),
        Arc::new(loops::ToolLoopDetectionHandler),
        Arc::new(loops::ToolLoopMaxRepeatsHandler),
        Arc::new(loops::ToolLoopTtlHandler),
        Arc::new(loops::ToolLoopModeHandler),
        Arc::new(failover::CreateFailoverRouteHandler),
        Arc::new(failover::DeleteFailoverRouteHandler),
        Arc::new(failover::ListFailoverRoutesHandler),
        Arc::new(failover::RouteAppendHandler),
        Arc::new(failover::RoutePrependHandler),
        Arc::new(failover::RouteClearHandler),
        Arc::new(failover::RouteListHandler),
    ]
}

/// Truthy / falsey booleanization shared by the toggle commands.
///
/// Truthy: `true`, `True`, `yes`, `1`, `on`.  Falsey: `false`, `False`,
/// `no`, `0`, `off`.  Anything else is `None`.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "True" | "yes" | "1" | "on" => Some(true),
        "false" | "False" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Resolve the single positional-or-named argument used by commands like
/// `model(gpt-4)` / `model(name=gpt-4)`: prefer the named keys, then fall
/// back to the first bare key.
pub(crate) fn single_arg<'a>(cmd: &'a Command, named: &[&str]) -> Option<&'a str> {
    for key in named {
        if let Some(v) = cmd.get(key) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    cmd.args
        .iter()
        .find(|(k, v)| v.is_empty() && !named.contains(&k.as_str()))
        .map(|(k, _)| k.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleanization_matches_documented_sets() {
        for v in ["true", "True", "yes", "1", "on"] {
            assert_eq!(parse_bool(v), Some(true), "truthy: {v}");
        }
        for v in ["false", "False", "no", "0", "off"] {
            assert_eq!(parse_bool(v), Some(false), "falsey: {v}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool("TRUE"), None);
    }

    #[test]
    fn single_arg_prefers_named_over_bare() {
        let cmd = Command {
            name: "model".into(),
            args: vec![
                ("gpt-3".to_string(), String::new()),
                ("name".to_string(), "gpt-4".to_string()),
            ],
        };
        assert_eq!(single_arg(&cmd, &["name"]), Some("gpt-4"));
    }

    #[test]
    fn single_arg_falls_back_to_bare_key() {
        let cmd = Command {
            name: "model".into(),
            args: vec![("gpt-4".to_string(), String::new())],
        };
        assert_eq!(single_arg(&cmd, &["name"]), Some("gpt-4"));
    }
}
