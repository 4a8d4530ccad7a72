// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use prism_config::Config;
use prism_connectors::{
    default_credentials_path, spawn_credentials_watcher, Connector, ConnectorRegistry,
    GeminiConnector, OpenAICompatConnector, QwenOAuthConnector, QwenOAuthManager,
};
use prism_gateway::AppState;

/// Exit codes: 0 OK, 1 configuration error, 2 credential error.
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_CREDENTIAL_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match prism_config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Some(Commands::ListBackends { json }) => list_backends(config, json).await,
        Some(Commands::Serve { port }) => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Build and initialize every configured connector.
async fn build_registry(config: &Config) -> (ConnectorRegistry, Option<Arc<QwenOAuthManager>>) {
    let mut registry = ConnectorRegistry::new();
    let timeout = config.server.request_timeout_seconds;
    let health = !config.session.disable_health_checks;

    let entry = |name: &str| config.backends.get(name).cloned().unwrap_or_default();

    let openai_entry = entry("openai");
    let openai_key = openai_entry
        .resolve_api_key()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()));
    register(
        &mut registry,
        Arc::new(OpenAICompatConnector::openai(
            openai_key,
            openai_entry.base_url,
            timeout,
            health,
        )),
    );

    let openrouter_entry = entry("openrouter");
    let openrouter_key = openrouter_entry
        .resolve_api_key()
        .or_else(|| std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.is_empty()));
    register(
        &mut registry,
        Arc::new(OpenAICompatConnector::openrouter(
            openrouter_key,
            openrouter_entry.base_url,
            timeout,
            health,
        )),
    );

    let zai_entry = entry("zai");
    let zai_key = zai_entry
        .resolve_api_key()
        .or_else(|| std::env::var("ZAI_API_KEY").ok().filter(|k| !k.is_empty()));
    register(
        &mut registry,
        Arc::new(OpenAICompatConnector::zai(
            zai_key,
            zai_entry.base_url,
            timeout,
            health,
        )),
    );

    let gemini_entry = entry("gemini");
    let gemini_key = gemini_entry
        .resolve_api_key()
        .or_else(|| std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()));
    if let Some(key) = gemini_key {
        register(
            &mut registry,
            Arc::new(GeminiConnector::new(key, gemini_entry.base_url, timeout)),
        );
    } else {
        warn!("gemini backend not registered: no API key configured");
    }

    // Qwen OAuth rides on the credentials file written by the provider CLI.
    let manager = Arc::new(QwenOAuthManager::new(default_credentials_path(), None));
    register(
        &mut registry,
        Arc::new(QwenOAuthConnector::new(Arc::clone(&manager), timeout, health)),
    );

    (registry, Some(manager))
}

fn register(registry: &mut ConnectorRegistry, connector: Arc<dyn Connector>) {
    let name = connector.name().to_string();
    if let Err(e) = registry.register(connector) {
        warn!(backend = %name, error = %e, "backend registration failed");
    }
}

async fn initialize_all(registry: &ConnectorRegistry) {
    for name in registry.names() {
        if let Some(connector) = registry.get(&name) {
            if let Err(e) = connector.initialize().await {
                warn!(backend = %name, error = %e, "backend initialization failed");
            }
        }
    }
}

async fn serve(config: Config) -> ExitCode {
    let (registry, qwen_manager) = build_registry(&config).await;
    initialize_all(&registry).await;

    let functional = registry.functional_names();
    if functional.is_empty() {
        eprintln!("credential error: no functional backends");
        return ExitCode::from(EXIT_CREDENTIAL_ERROR);
    }
    info!(backends = ?functional, "functional backends");

    if let Some(manager) = qwen_manager {
        spawn_credentials_watcher(manager);
    }

    let state = Arc::new(AppState::new(config, Arc::new(registry)));
    state.sessions.start_eviction_task(60);

    match prism_gateway::run(state).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("server error: {e:#}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn list_backends(config: Config, json: bool) -> ExitCode {
    let (registry, _) = build_registry(&config).await;
    initialize_all(&registry).await;

    if json {
        let entries: Vec<serde_json::Value> = registry
            .names()
            .into_iter()
            .map(|name| {
                let functional = registry
                    .get(&name)
                    .map(|c| c.is_functional())
                    .unwrap_or(false);
                serde_json::json!({"name": name, "functional": functional})
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
    } else {
        for name in registry.names() {
            let functional = registry
                .get(&name)
                .map(|c| c.is_functional())
                .unwrap_or(false);
            let marker = if functional { "ok" } else { "unavailable" };
            println!("{name:<16} {marker}");
        }
    }
    ExitCode::SUCCESS
}
