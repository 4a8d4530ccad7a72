// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::debug;

use prism_domain::ChatRequest;

use super::{RequestMiddleware, RequestPipelineContext};

/// Routes early session turns to a stronger planning model.
///
/// While the session is inside its planning budget (turns and file writes
/// both under their limits), the request model is rewritten to
/// `strong_model` and the turn counter advances.  The switch condition
/// reads the counters; it never mutates the config itself.
pub struct PlanningPhaseMiddleware;

impl RequestMiddleware for PlanningPhaseMiddleware {
    fn name(&self) -> &'static str {
        "planning_phase"
    }

    /// Last in the request chain: the planning route wins over one-off
    /// rewrites and failover expansion.
    fn priority(&self) -> i32 {
        10
    }

    fn process(&self, mut request: ChatRequest, ctx: &mut RequestPipelineContext) -> ChatRequest {
        let config = &ctx.state.planning_phase_config;
        if !config.enabled {
            return request;
        }
        let Some(strong_model) = config.strong_model.clone() else {
            return request;
        };
        if ctx.state.planning_phase_turn_count >= config.max_turns
            || ctx.state.planning_phase_file_write_count >= config.max_file_writes
        {
            return request;
        }

        debug!(
            session_id = %ctx.session_id,
            turn = ctx.state.planning_phase_turn_count,
            strong_model = %strong_model,
            "planning phase: routing to strong model"
        );
        request.model = strong_model;
        let turns = ctx.state.planning_phase_turn_count + 1;
        ctx.update_state(ctx.state.with_planning_phase_turn_count(turns));
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_domain::{ChatMessage, PlanningPhaseConfig, SessionState};

    fn planning_state(max_turns: u32, turn_count: u32) -> SessionState {
        let state = SessionState::default().with_planning_phase_config(PlanningPhaseConfig {
            enabled: true,
            strong_model: Some("openai:o1".into()),
            max_turns,
            max_file_writes: 1,
        });
        state.with_planning_phase_turn_count(turn_count)
    }

    #[test]
    fn planning_turns_use_strong_model_and_count_up() {
        let mut ctx = RequestPipelineContext::new("s1", planning_state(3, 0));
        let out = PlanningPhaseMiddleware
            .process(ChatRequest::new("gpt-4", vec![ChatMessage::user("plan")]), &mut ctx);
        assert_eq!(out.model, "openai:o1");
        assert_eq!(ctx.state.planning_phase_turn_count, 1);
        assert!(ctx.state_changed);
    }

    #[test]
    fn budget_exhaustion_stops_routing() {
        let mut ctx = RequestPipelineContext::new("s1", planning_state(2, 2));
        let out = PlanningPhaseMiddleware
            .process(ChatRequest::new("gpt-4", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "gpt-4");
        assert!(!ctx.state_changed);
    }

    #[test]
    fn file_write_budget_also_gates() {
        let state = planning_state(10, 0).with_planning_phase_file_write_count(1);
        let mut ctx = RequestPipelineContext::new("s1", state);
        let out = PlanningPhaseMiddleware
            .process(ChatRequest::new("gpt-4", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "gpt-4");
    }

    #[test]
    fn disabled_phase_is_a_no_op() {
        let mut ctx = RequestPipelineContext::new("s1", SessionState::default());
        let out = PlanningPhaseMiddleware
            .process(ChatRequest::new("gpt-4", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "gpt-4");
    }

    #[test]
    fn counters_never_mutate_config() {
        let mut ctx = RequestPipelineContext::new("s1", planning_state(3, 0));
        PlanningPhaseMiddleware
            .process(ChatRequest::new("gpt-4", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(ctx.state.planning_phase_config.max_turns, 3);
        assert!(ctx.state.planning_phase_config.enabled);
    }
}
