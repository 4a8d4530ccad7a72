// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Loop-detection configuration commands.

use prism_domain::{Session, ToolLoopMode};

use super::{parse_bool, single_arg};
use crate::parser::Command;
use crate::registry::{CommandContext, CommandHandler, CommandResult};

/// Resolve the `enabled=` argument for the toggle commands.
///
/// A missing argument defaults to enable; an unrecognized value is an
/// error.
fn parse_enabled(cmd: &Command) -> Result<bool, String> {
    match single_arg(cmd, &["enabled", "value"]) {
        None => Ok(true),
        Some(value) => {
            parse_bool(value).ok_or_else(|| format!("Invalid value for enabled: {value}"))
        }
    }
}

pub struct LoopDetectionHandler;

impl CommandHandler for LoopDetectionHandler {
    fn name(&self) -> &'static str {
        "loop-detection"
    }

    fn description(&self) -> &'static str {
        "Enable or disable response loop detection"
    }

    fn usage(&self) -> String {
        "loop-detection(enabled=true|false)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let enabled = match parse_enabled(cmd) {
            Ok(v) => v,
            Err(message) => return CommandResult::fail(self.name(), message),
        };
        let loop_config = session.state.loop_config.with_loop_detection(enabled);
        let state = session.state.with_loop_config(loop_config);
        let message = if enabled { "Loop detection enabled" } else { "Loop detection disabled" };
        CommandResult::ok_with_state(self.name(), message, state)
    }
}

pub struct ToolLoopDetectionHandler;

impl CommandHandler for ToolLoopDetectionHandler {
    fn name(&self) -> &'static str {
        "tool-loop-detection"
    }

    fn description(&self) -> &'static str {
        "Enable or disable tool-call loop detection"
    }

    fn usage(&self) -> String {
        "tool-loop-detection(enabled=true|false)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let enabled = match parse_enabled(cmd) {
            Ok(v) => v,
            Err(message) => return CommandResult::fail(self.name(), message),
        };
        let loop_config = session.state.loop_config.with_tool_loop_detection(enabled);
        let state = session.state.with_loop_config(loop_config);
        let message = if enabled {
            "Tool loop detection enabled"
        } else {
            "Tool loop detection disabled"
        };
        CommandResult::ok_with_state(self.name(), message, state)
    }
}

pub struct ToolLoopMaxRepeatsHandler;

impl CommandHandler for ToolLoopMaxRepeatsHandler {
    fn name(&self) -> &'static str {
        "tool-loop-max-repeats"
    }

    fn description(&self) -> &'static str {
        "Set the maximum number of repeats for tool loop detection"
    }

    fn usage(&self) -> String {
        "tool-loop-max-repeats(max_repeats=<number>)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(value) = single_arg(cmd, &["max_repeats", "value"]) else {
            return CommandResult::fail(self.name(), "Max repeats must be specified");
        };
        let Ok(max_repeats) = value.parse::<u32>() else {
            return CommandResult::fail(self.name(), "Max repeats must be a valid integer");
        };
        if max_repeats < 2 {
            return CommandResult::fail(self.name(), "Max repeats must be at least 2");
        }
        let loop_config = session
            .state
            .loop_config
            .with_tool_loop_max_repeats(Some(max_repeats));
        let state = session.state.with_loop_config(loop_config);
        CommandResult::ok_with_state(
            self.name(),
            format!("Tool loop max repeats set to {max_repeats}"),
            state,
        )
    }
}

pub struct ToolLoopTtlHandler;

impl CommandHandler for ToolLoopTtlHandler {
    fn name(&self) -> &'static str {
        "tool-loop-ttl"
    }

    fn description(&self) -> &'static str {
        "Set the time window for tool loop detection"
    }

    fn usage(&self) -> String {
        "tool-loop-ttl(ttl_seconds=<number>)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(value) = single_arg(cmd, &["ttl_seconds", "value"]) else {
            return CommandResult::fail(self.name(), "TTL seconds must be specified");
        };
        let Ok(ttl) = value.parse::<u64>() else {
            return CommandResult::fail(self.name(), "TTL seconds must be a valid integer");
        };
        if ttl < 1 {
            return CommandResult::fail(self.name(), "TTL seconds must be at least 1");
        }
        let loop_config = session.state.loop_config.with_tool_loop_ttl_seconds(Some(ttl));
        let state = session.state.with_loop_config(loop_config);
        CommandResult::ok_with_state(
            self.name(),
            format!("Tool loop TTL set to {ttl} seconds"),
            state,
        )
    }
}

pub struct ToolLoopModeHandler;

impl CommandHandler for ToolLoopModeHandler {
    fn name(&self) -> &'static str {
        "tool-loop-mode"
    }

    fn description(&self) -> &'static str {
        "Set how tool loop detection reacts: break or chance_then_break"
    }

    fn usage(&self) -> String {
        "tool-loop-mode(mode=break|chance_then_break)".to_string()
    }

    fn execute(&self, cmd: &Command, session: &Session, _ctx: &CommandContext) -> CommandResult {
        let Some(value) = single_arg(cmd, &["mode", "value"]) else {
            return CommandResult::fail(self.name(), "Mode must be specified");
        };
        let Some(mode) = ToolLoopMode::parse(value) else {
            return CommandResult::fail(
                self.name(),
                "Mode must be one of: break, chance_then_break",
            );
        };
        let loop_config = session.state.loop_config.with_tool_loop_mode(mode);
        let state = session.state.with_loop_config(loop_config);
        CommandResult::ok_with_state(self.name(), format!("Tool loop mode set to {value}"), state)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("test")
    }

    fn ctx() -> CommandContext {
        CommandContext::default()
    }

    fn cmd(name: &str, args: &[(&str, &str)]) -> Command {
        Command {
            name: name.to_string(),
            args: args.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn loop_detection_defaults_to_enable_without_args() {
        let mut s = session();
        s.state = s.state.with_loop_config(s.state.loop_config.with_loop_detection(false));
        let result = LoopDetectionHandler.execute(&cmd("loop-detection", &[]), &s, &ctx());
        assert!(result.success);
        assert!(result.new_state.unwrap().loop_config.loop_detection_enabled);
    }

    #[test]
    fn loop_detection_accepts_falsey_values() {
        for value in ["false", "no", "0", "off", "False"] {
            let result = LoopDetectionHandler.execute(
                &cmd("loop-detection", &[("enabled", value)]),
                &session(),
                &ctx(),
            );
            assert!(result.success, "{value}");
            assert!(
                !result.new_state.unwrap().loop_config.loop_detection_enabled,
                "{value}"
            );
        }
    }

    #[test]
    fn loop_detection_rejects_garbage() {
        let result = LoopDetectionHandler.execute(
            &cmd("loop-detection", &[("enabled", "perhaps")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);
        assert!(result.message.contains("Invalid value"));
    }

    #[test]
    fn tool_loop_detection_toggles() {
        let result = ToolLoopDetectionHandler.execute(
            &cmd("tool-loop-detection", &[("enabled", "off")]),
            &session(),
            &ctx(),
        );
        assert!(result.success);
        assert!(!result.new_state.unwrap().loop_config.tool_loop_detection_enabled);
    }

    #[test]
    fn max_repeats_lower_bound_is_two() {
        let result = ToolLoopMaxRepeatsHandler.execute(
            &cmd("tool-loop-max-repeats", &[("max_repeats", "1")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);
        assert_eq!(result.message, "Max repeats must be at least 2");

        let ok = ToolLoopMaxRepeatsHandler.execute(
            &cmd("tool-loop-max-repeats", &[("max_repeats", "2")]),
            &session(),
            &ctx(),
        );
        assert!(ok.success);
        assert_eq!(
            ok.new_state.unwrap().loop_config.tool_loop_max_repeats,
            Some(2)
        );
    }

    #[test]
    fn max_repeats_rejects_non_integers() {
        let result = ToolLoopMaxRepeatsHandler.execute(
            &cmd("tool-loop-max-repeats", &[("max_repeats", "many")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);
        assert_eq!(result.message, "Max repeats must be a valid integer");
    }

    #[test]
    fn ttl_lower_bound_is_one() {
        let result = ToolLoopTtlHandler.execute(
            &cmd("tool-loop-ttl", &[("ttl_seconds", "0")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);

        let ok = ToolLoopTtlHandler.execute(
            &cmd("tool-loop-ttl", &[("ttl_seconds", "120")]),
            &session(),
            &ctx(),
        );
        assert!(ok.success);
        assert_eq!(
            ok.new_state.unwrap().loop_config.tool_loop_ttl_seconds,
            Some(120)
        );
    }

    #[test]
    fn mode_accepts_both_variants() {
        let result = ToolLoopModeHandler.execute(
            &cmd("tool-loop-mode", &[("mode", "chance_then_break")]),
            &session(),
            &ctx(),
        );
        assert!(result.success);
        assert_eq!(
            result.new_state.unwrap().loop_config.tool_loop_mode,
            ToolLoopMode::ChanceThenBreak
        );
    }

    #[test]
    fn mode_rejects_unknown_values() {
        let result = ToolLoopModeHandler.execute(
            &cmd("tool-loop-mode", &[("mode", "explode")]),
            &session(),
            &ctx(),
        );
        assert!(!result.success);
    }
}
