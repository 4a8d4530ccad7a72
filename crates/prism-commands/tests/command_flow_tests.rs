// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end command language properties: state is the left fold of the
//! applied commands, set/unset inverts, and the scan strategy touches only
//! the right message.

use prism_commands::{process_messages, CommandContext, CommandParser, CommandRegistry};
use prism_domain::{ChatMessage, Session, SessionState};

fn setup() -> (CommandParser, CommandRegistry, CommandContext) {
    (
        CommandParser::default(),
        CommandRegistry::with_builtins(),
        CommandContext {
            registered_backends: vec![
                "openai".into(),
                "openrouter".into(),
                "anthropic".into(),
                "gemini".into(),
            ],
            functional_backends: vec!["openai".into(), "openrouter".into(), "gemini".into()],
        },
    )
}

/// Apply a sequence of single-command prompts, folding the state forward
/// like the orchestrator does.
fn fold_commands(prompts: &[&str]) -> SessionState {
    let (parser, registry, ctx) = setup();
    let mut session = Session::new("fold");
    for prompt in prompts {
        let mut messages = vec![ChatMessage::user(prompt.to_string())];
        let processed = process_messages(&parser, &registry, &mut messages, &session, &ctx);
        for result in processed.results {
            if let Some(state) = result.new_state {
                session.update_state(state);
            }
        }
    }
    session.state
}

#[test]
fn state_is_the_left_fold_of_the_command_sequence() {
    let state = fold_commands(&[
        "!/set(model=openrouter:gpt-4)",
        "!/temperature(value=0.3)",
        "!/create-failover-route(name=r, policy=k)",
        "!/route-append(name=r, element=openai:gpt-4)",
        "!/tool-loop-max-repeats(max_repeats=6)",
    ]);
    assert_eq!(state.backend_config.backend_type.as_deref(), Some("openrouter"));
    assert_eq!(state.backend_config.model.as_deref(), Some("gpt-4"));
    assert_eq!(state.reasoning_config.temperature, Some(0.3));
    assert_eq!(
        state.backend_config.failover_routes["r"].elements,
        vec!["openai:gpt-4"]
    );
    assert_eq!(state.loop_config.tool_loop_max_repeats, Some(6));
}

#[test]
fn applying_the_same_sequence_twice_yields_equal_states() {
    let sequence = [
        "!/set(model=gemini:gemini-pro, temperature=0.2)",
        "!/loop-detection(enabled=false)",
    ];
    assert_eq!(fold_commands(&sequence), fold_commands(&sequence));
}

#[test]
fn set_then_unset_returns_to_the_initial_state() {
    let state = fold_commands(&[
        "!/set(model=gpt-4, temperature=0.5, project=acme)",
        "!/unset(model, temperature, project)",
    ]);
    assert_eq!(state, SessionState::default());
}

#[test]
fn oneoff_then_unset_oneoff_is_identity() {
    let state = fold_commands(&["!/oneoff(openai/gpt-4)", "!/unset(oneoff)"]);
    assert_eq!(state, SessionState::default());
}

#[test]
fn failed_commands_leave_state_untouched() {
    let state = fold_commands(&[
        "!/temperature(value=7)",
        "!/tool-loop-max-repeats(max_repeats=1)",
        "!/model(name=unregistered-backend:m)",
    ]);
    assert_eq!(state, SessionState::default());
}

#[test]
fn scan_strategy_processes_only_the_last_command_bearing_message() {
    let (parser, registry, ctx) = setup();
    let session = Session::new("scan");
    let mut messages = vec![
        ChatMessage::user("!/set(temperature=0.9) early turn"),
        ChatMessage::assistant("noted"),
        ChatMessage::user("!/set(temperature=0.1) later turn"),
    ];
    let processed = process_messages(&parser, &registry, &mut messages, &session, &ctx);
    assert_eq!(processed.results.len(), 1);
    assert_eq!(
        processed.results[0].new_state.as_ref().unwrap().reasoning_config.temperature,
        Some(0.1)
    );
    // The earlier message keeps its command text for history fidelity.
    assert_eq!(messages[0].as_text(), Some("!/set(temperature=0.9) early turn"));
    assert_eq!(messages[2].as_text(), Some(" later turn"));
}

#[test]
fn help_lists_every_registered_command() {
    let (parser, registry, ctx) = setup();
    let session = Session::new("help");
    let mut messages = vec![ChatMessage::user("!/help")];
    let processed = process_messages(&parser, &registry, &mut messages, &session, &ctx);
    let message = &processed.results[0].message;
    for name in ["set", "unset", "model", "oneoff", "tool-loop-mode", "route-append"] {
        assert!(message.contains(name), "help output missing {name}: {message}");
    }
}

#[test]
fn unmatched_closing_paren_is_no_command() {
    let (parser, registry, ctx) = setup();
    let session = Session::new("edge");
    let original = "!/set(model=gpt-4";
    let mut messages = vec![ChatMessage::user(original)];
    let processed = process_messages(&parser, &registry, &mut messages, &session, &ctx);
    assert!(!processed.executed);
    assert_eq!(messages[0].as_text(), Some(original));
}
