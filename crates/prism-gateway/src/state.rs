// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use prism_commands::{CommandContext, CommandParser, CommandRegistry};
use prism_config::Config;
use prism_connectors::ConnectorRegistry;
use prism_pipeline::reactor::dangerous::{DangerousCommandHandler, DangerousCommandScanner};
use prism_pipeline::reactor::pytest::{PytestCompressionHandler, PytestFullSuiteHandler};
use prism_pipeline::reactor::ToolCallReactor;
use prism_pipeline::request::{
    EditPrecisionMiddleware, FailoverRouteMiddleware, OneoffMiddleware, PlanningPhaseMiddleware,
    RequestPipeline,
};
use prism_pipeline::response::json_repair_mw::JsonRepairMiddleware;
use prism_pipeline::response::loop_detection::LoopDetectionMiddleware;
use prism_pipeline::response::reactor_mw::ToolCallReactorMiddleware;
use prism_pipeline::response::ResponsePipeline;
use prism_session::SessionService;

/// Everything a request handler needs, assembled once at startup.
pub struct AppState {
    pub config: Config,
    pub connectors: Arc<ConnectorRegistry>,
    pub sessions: Arc<SessionService>,
    pub command_parser: CommandParser,
    pub command_registry: CommandRegistry,
    pub request_pipeline: RequestPipeline,
    pub response_pipeline: ResponsePipeline,
}

impl AppState {
    /// Wire the full pipeline from configuration and a populated connector
    /// registry.
    pub fn new(config: Config, connectors: Arc<ConnectorRegistry>) -> Self {
        let sessions = Arc::new(SessionService::new(config.session.ttl_seconds));

        let mut reactor = ToolCallReactor::new();
        if config.dangerous_commands.enabled {
            let scanner = Arc::new(DangerousCommandScanner::new(
                config.dangerous_commands.tool_names.clone(),
            ));
            reactor
                .register_handler(Arc::new(DangerousCommandHandler::new(
                    scanner,
                    config.dangerous_commands.steering_message.clone(),
                )))
                .expect("fresh reactor accepts the dangerous-command handler");
        }
        if config.pytest.full_suite_steering_enabled {
            reactor
                .register_handler(Arc::new(PytestFullSuiteHandler::new(
                    None,
                    config.pytest.full_suite_ttl_seconds,
                )))
                .expect("fresh reactor accepts the full-suite handler");
        }
        if config.pytest.compression_enabled {
            reactor
                .register_handler(Arc::new(PytestCompressionHandler::new(Arc::clone(&sessions))))
                .expect("fresh reactor accepts the compression handler");
        }
        let reactor = Arc::new(reactor);

        let request_pipeline = RequestPipeline::new(vec![
            Arc::new(EditPrecisionMiddleware::new(config.edit_precision.clone())),
            Arc::new(OneoffMiddleware),
            Arc::new(FailoverRouteMiddleware),
            Arc::new(PlanningPhaseMiddleware),
        ]);

        let response_pipeline = ResponsePipeline::new(vec![
            Arc::new(ToolCallReactorMiddleware::new(reactor)),
            Arc::new(JsonRepairMiddleware::new(
                config.session.json_repair_enabled,
                config.session.json_repair_buffer_cap_bytes,
                config.session.json_repair_strict_mode,
                None,
            )),
            Arc::new(LoopDetectionMiddleware::new()),
        ]);

        let command_parser = CommandParser::new(config.session.command_prefix.clone());

        Self {
            config,
            connectors,
            sessions,
            command_parser,
            command_registry: CommandRegistry::with_builtins(),
            request_pipeline,
            response_pipeline,
        }
    }

    /// Snapshot of backend knowledge for the command handlers.
    pub fn command_context(&self) -> CommandContext {
        CommandContext {
            registered_backends: self.connectors.names(),
            functional_backends: self.connectors.functional_names(),
        }
    }
}
