// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Failover route expansion.
//!
//! A request whose model is `route:<name>` is rewritten to the route's
//! first element; the full ordered element list is stashed under the
//! internal `_failover_attempts` extra-body key for the dispatcher, which
//! retries down the list on retryable backend errors.  Internal keys never
//! reach the upstream payload.

use serde_json::json;
use tracing::{debug, warn};

use prism_domain::{ChatRequest, SessionState};

use super::{RequestMiddleware, RequestPipelineContext};

pub const FAILOVER_ATTEMPTS_KEY: &str = "_failover_attempts";

/// The ordered dispatch targets for a request: the route elements when the
/// middleware expanded one, otherwise the request model itself.
pub fn route_attempts(request: &ChatRequest) -> Vec<String> {
    request
        .extra_body
        .get(FAILOVER_ATTEMPTS_KEY)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .filter(|attempts: &Vec<String>| !attempts.is_empty())
        .unwrap_or_else(|| vec![request.model.clone()])
}

pub struct FailoverRouteMiddleware;

impl FailoverRouteMiddleware {
    fn lookup<'a>(model: &str, state: &'a SessionState) -> Option<&'a prism_domain::FailoverRoute> {
        let name = model.strip_prefix("route:")?;
        state.backend_config.failover_routes.get(name)
    }
}

impl RequestMiddleware for FailoverRouteMiddleware {
    fn name(&self) -> &'static str {
        "failover_route"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn process(&self, mut request: ChatRequest, ctx: &mut RequestPipelineContext) -> ChatRequest {
        let Some(route) = Self::lookup(&request.model, &ctx.state) else {
            if request.model.starts_with("route:") {
                warn!(
                    session_id = %ctx.session_id,
                    model = %request.model,
                    "request names an unknown failover route"
                );
            }
            return request;
        };
        if route.elements.is_empty() {
            warn!(route = %route.name, "failover route has no elements");
            return request;
        }

        debug!(
            session_id = %ctx.session_id,
            route = %route.name,
            elements = route.elements.len(),
            "expanding failover route"
        );
        request.extra_body.insert(
            FAILOVER_ATTEMPTS_KEY.to_string(),
            json!(route.elements),
        );
        request.model = route.elements[0].clone();
        request
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prism_domain::{ChatMessage, FailoverRoute, RoutePolicy};

    fn state_with_route(elements: &[&str]) -> SessionState {
        let mut route = FailoverRoute::new("r", RoutePolicy::K);
        route.elements = elements.iter().map(|s| s.to_string()).collect();
        let state = SessionState::default();
        state.with_backend_config(state.backend_config.with_route(route))
    }

    #[test]
    fn route_model_expands_to_first_element() {
        let mut ctx = RequestPipelineContext::new(
            "s1",
            state_with_route(&["openai:gpt-4", "anthropic:claude-3-opus"]),
        );
        let out = FailoverRouteMiddleware
            .process(ChatRequest::new("route:r", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "openai:gpt-4");
        assert_eq!(
            route_attempts(&out),
            vec!["openai:gpt-4".to_string(), "anthropic:claude-3-opus".to_string()]
        );
    }

    #[test]
    fn plain_model_yields_single_attempt() {
        let req = ChatRequest::new("openai:gpt-4", vec![ChatMessage::user("x")]);
        assert_eq!(route_attempts(&req), vec!["openai:gpt-4".to_string()]);
    }

    #[test]
    fn unknown_route_passes_through() {
        let mut ctx = RequestPipelineContext::new("s1", SessionState::default());
        let out = FailoverRouteMiddleware
            .process(ChatRequest::new("route:ghost", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "route:ghost");
        assert!(out.extra_body.get(FAILOVER_ATTEMPTS_KEY).is_none());
    }

    #[test]
    fn empty_route_passes_through() {
        let mut ctx = RequestPipelineContext::new("s1", state_with_route(&[]));
        let out = FailoverRouteMiddleware
            .process(ChatRequest::new("route:r", vec![ChatMessage::user("x")]), &mut ctx);
        assert_eq!(out.model, "route:r");
    }

    #[test]
    fn attempts_bound_the_dispatch_count() {
        // At most |elements| upstream attempts, in declared order.
        let mut ctx = RequestPipelineContext::new(
            "s1",
            state_with_route(&["a:1", "b:2", "c:3"]),
        );
        let out = FailoverRouteMiddleware
            .process(ChatRequest::new("route:r", vec![ChatMessage::user("x")]), &mut ctx);
        let attempts = route_attempts(&out);
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts, vec!["a:1", "b:2", "c:3"]);
    }
}
