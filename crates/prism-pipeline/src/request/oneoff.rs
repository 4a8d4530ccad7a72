// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::info;

use prism_domain::ChatRequest;

use super::{RequestMiddleware, RequestPipelineContext};

/// Consumes a pending one-off backend/model override.
///
/// The rewrite and the clearing of the pair happen in the same pass; the
/// orchestrator commits the cleared state with the request, so the
/// override is consumed exactly once.
pub struct OneoffMiddleware;

impl RequestMiddleware for OneoffMiddleware {
    fn name(&self) -> &'static str {
        "oneoff"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn process(&self, mut request: ChatRequest, ctx: &mut RequestPipelineContext) -> ChatRequest {
        let backend_config = &ctx.state.backend_config;
        let (Some(backend), Some(model)) =
            (backend_config.oneoff_backend.clone(), backend_config.oneoff_model.clone())
        else {
            return request;
        };

        info!(
            session_id = %ctx.session_id,
            backend = %backend,
            model = %model,
            "consuming one-off route"
        );
        request.model = format!("{backend}:{model}");
        let cleared = ctx.state.backend_config.without_oneoff_route();
        ctx.update_state(ctx.state.with_backend_config(cleared));
        request
    }
}
