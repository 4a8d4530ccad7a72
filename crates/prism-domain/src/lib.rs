// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical domain model for the prism proxy.
//!
//! Every ingress adapter converts its wire format into these types at the
//! edge; everything downstream (commands, middleware, connectors) sees only
//! the canonical model.  Session state is an immutable value — every
//! mutation goes through a `with_*` helper that returns a new copy.

mod capabilities;
mod chat;
mod envelope;
mod error;
mod model_id;
mod session;

pub use capabilities::{ModelCapabilities, RateLimits};
pub use chat::{
    parse_data_url_parts, ChatMessage, ChatRequest, ContentPart, FunctionCall, FunctionSpec,
    MessageContent, Role, ToolCall, ToolChoice, ToolDefinition,
};
pub use envelope::{BackendResponse, ByteStream, ResponseEnvelope, StreamingResponseEnvelope};
pub use error::ProxyError;
pub use model_id::parse_model_backend;
pub use session::{
    BackendConfig, FailoverRoute, LoopConfig, PlanningPhaseConfig, ReasoningConfig, RoutePolicy,
    Session, SessionInteraction, SessionState, ToolLoopMode, MAX_HISTORY_ENTRIES,
};
