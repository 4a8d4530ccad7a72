// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request middleware chain.
//!
//! Middlewares are ordered by declared priority (higher first) and each
//! takes the request by value, returning a possibly new one.  A middleware
//! may also update the session state snapshot carried in the context; the
//! orchestrator commits the final state once the chain finishes.

mod edit_precision;
mod failover;
mod oneoff;
mod planning;

pub use edit_precision::EditPrecisionMiddleware;
pub use failover::{route_attempts, FailoverRouteMiddleware, FAILOVER_ATTEMPTS_KEY};
pub use oneoff::OneoffMiddleware;
pub use planning::PlanningPhaseMiddleware;

use std::sync::Arc;

use prism_domain::{ChatRequest, SessionState};

/// Mutable per-request context threaded through the chain.
pub struct RequestPipelineContext {
    pub session_id: String,
    pub state: SessionState,
    /// Set when a middleware changed `state`; the orchestrator must commit
    /// the new value back to the session store.
    pub state_changed: bool,
}

impl RequestPipelineContext {
    pub fn new(session_id: impl Into<String>, state: SessionState) -> Self {
        Self { session_id: session_id.into(), state, state_changed: false }
    }

    pub fn update_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_changed = true;
    }
}

pub trait RequestMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher priorities run first.
    fn priority(&self) -> i32;

    fn process(&self, request: ChatRequest, ctx: &mut RequestPipelineContext) -> ChatRequest;
}

/// Priority-ordered chain of request middlewares.
pub struct RequestPipeline {
    middlewares: Vec<Arc<dyn RequestMiddleware>>,
}

impl RequestPipeline {
    pub fn new(mut middlewares: Vec<Arc<dyn RequestMiddleware>>) -> Self {
        middlewares.sort_by_key(|m| std::cmp::Reverse(m.priority()));
        Self { middlewares }
    }

    pub fn process(
        &self,
        mut request: ChatRequest,
        ctx: &mut RequestPipelineContext,
    ) -> ChatRequest {
        for middleware in &self.middlewares {
            request = middleware.process(request, ctx);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_domain::ChatMessage;

    struct Tag(&'static str, i32);

    impl RequestMiddleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        fn process(&self, mut request: ChatRequest, _ctx: &mut RequestPipelineContext) -> ChatRequest {
            request.model.push_str(self.0);
            request
        }
    }

    #[test]
    fn middlewares_run_in_descending_priority() {
        let pipeline = RequestPipeline::new(vec![
            Arc::new(Tag("-low", 1)),
            Arc::new(Tag("-high", 100)),
            Arc::new(Tag("-mid", 50)),
        ]);
        let mut ctx = RequestPipelineContext::new("s", SessionState::default());
        let out = pipeline.process(ChatRequest::new("m", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "m-high-mid-low");
    }
}
