// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use prism_config::IdentityConfig;
use prism_domain::{BackendResponse, ChatRequest, ProxyError};

/// Common contract for every upstream backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable backend id used in `backend:model` specs.
    fn name(&self) -> &str;

    /// Whether the connector passed initialization and can take traffic.
    fn is_functional(&self) -> bool {
        true
    }

    /// Idempotent: stores configuration, may lazily fetch tokens/models.
    async fn initialize(&self) -> Result<(), ProxyError>;

    /// Cached model list; may be empty until the async variant ran.
    fn get_available_models(&self) -> Vec<String>;

    /// Refreshing model list; provider-specific discovery when supported.
    async fn get_available_models_async(&self) -> Result<Vec<String>, ProxyError>;

    /// Forward one chat completion.
    ///
    /// `identity` must be resolved per call and never cached across calls
    /// with different callers.
    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        identity: Option<&IdentityConfig>,
    ) -> Result<BackendResponse, ProxyError>;
}

/// Process-wide backend registry, written once at startup.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Result<(), ProxyError> {
        let name = connector.name().to_string();
        if self.connectors.contains_key(&name) {
            return Err(ProxyError::invalid_request(format!(
                "backend '{name}' is already registered"
            )));
        }
        self.connectors.insert(name, connector);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub fn functional_names(&self) -> Vec<String> {
        self.connectors
            .values()
            .filter(|c| c.is_functional())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Aggregate `backend:model` ids across every registered connector.
    pub fn aggregate_models(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, connector) in &self.connectors {
            for model in connector.get_available_models() {
                out.push(format!("{name}:{model}"));
            }
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
