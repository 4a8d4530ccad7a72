// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Qwen OAuth backend.
//!
//! Layers the OAuth credential lifecycle on top of the OpenAI-compatible
//! transport.  Startup validation gates the connector: a missing, broken,
//! or expired credentials file marks it non-functional with a structured
//! error list, and every call fails with `No valid OAuth credentials`
//! until the file watcher observes a fix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use prism_config::IdentityConfig;
use prism_domain::{BackendResponse, ChatRequest, ProxyError};

use crate::connector::Connector;
use crate::oauth::QwenOAuthManager;
use crate::openai_compat::OpenAICompatConnector;

pub const DEFAULT_ENDPOINT: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Models served through the Qwen OAuth endpoint.
const KNOWN_MODELS: &[&str] = &[
    "qwen3-coder-plus",
    "qwen3-coder-flash",
    "qwen-turbo",
    "qwen-plus",
    "qwen-max",
    "qwen2.5-72b-instruct",
    "qwen2.5-32b-instruct",
    "qwen2.5-14b-instruct",
    "qwen2.5-7b-instruct",
];

pub struct QwenOAuthConnector {
    manager: Arc<QwenOAuthManager>,
    transport: OpenAICompatConnector,
    functional: AtomicBool,
    validation_errors: RwLock<Vec<String>>,
    health_check_enabled: bool,
}

impl QwenOAuthConnector {
    pub fn new(manager: Arc<QwenOAuthManager>, timeout_seconds: u64, health_check_enabled: bool) -> Self {
        Self {
            manager,
            // The bearer token is swapped per call, so the transport holds
            // no key of its own.
            transport: OpenAICompatConnector::new(
                "qwen-oauth",
                None,
                DEFAULT_ENDPOINT,
                timeout_seconds,
                false,
            ),
            functional: AtomicBool::new(false),
            validation_errors: RwLock::new(Vec::new()),
            health_check_enabled,
        }
    }

    pub fn manager(&self) -> &Arc<QwenOAuthManager> {
        &self.manager
    }

    pub async fn validation_errors(&self) -> Vec<String> {
        self.validation_errors.read().await.clone()
    }

    /// Re-run validation after a credentials change (called on watcher
    /// events and at startup).
    pub async fn revalidate(&self) {
        let errors = self.manager.load().await;
        let functional = errors.is_empty();
        self.functional.store(functional, Ordering::Relaxed);
        *self.validation_errors.write().await = errors.clone();
        if functional {
            info!("qwen-oauth backend is functional");
        } else {
            warn!(?errors, "qwen-oauth backend marked non-functional");
        }
    }

    async fn endpoint(&self) -> String {
        self.manager
            .credentials()
            .await
            .and_then(|c| c.api_base_url())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    /// Optional first-use liveness probe against `/models`.
    async fn health_probe(&self, bearer: &str, base_url: &str) -> Result<(), ProxyError> {
        if !self.health_check_enabled {
            return Ok(());
        }
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{base_url}/models"))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("qwen health check failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ProxyError::backend_with_status(
                format!("qwen health check returned {}", response.status()),
                "health_check_failed",
                response.status().as_u16(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for QwenOAuthConnector {
    fn name(&self) -> &str {
        "qwen-oauth"
    }

    fn is_functional(&self) -> bool {
        self.functional.load(Ordering::Relaxed)
    }

    async fn initialize(&self) -> Result<(), ProxyError> {
        self.revalidate().await;
        if self.is_functional() {
            // Refresh proactively so the first request does not pay for it.
            if let Err(e) = self.manager.refresh_if_needed().await {
                warn!(error = %e, "initial qwen token refresh failed");
                self.functional.store(false, Ordering::Relaxed);
                self.validation_errors.write().await.push(e.to_string());
            }
        }
        Ok(())
    }

    fn get_available_models(&self) -> Vec<String> {
        if !self.is_functional() {
            return Vec::new();
        }
        KNOWN_MODELS.iter().map(|m| m.to_string()).collect()
    }

    async fn get_available_models_async(&self) -> Result<Vec<String>, ProxyError> {
        Ok(self.get_available_models())
    }

    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        identity: Option<&IdentityConfig>,
    ) -> Result<BackendResponse, ProxyError> {
        if !self.is_functional() {
            return Err(ProxyError::backend("No valid OAuth credentials"));
        }
        self.manager.refresh_if_needed().await.map_err(|e| match e {
            ProxyError::Backend { .. } => e,
            other => ProxyError::authentication(format!(
                "failed to refresh Qwen OAuth token: {other}"
            )),
        })?;

        let Some(credentials) = self.manager.credentials().await else {
            return Err(ProxyError::backend("No valid OAuth credentials"));
        };

        let model = effective_model
            .strip_prefix("qwen-oauth:")
            .unwrap_or(effective_model);
        let base_url = self.endpoint().await;
        self.health_probe(&credentials.access_token, &base_url).await?;

        self.transport
            .dispatch(request, model, identity, &credentials.access_token, &base_url)
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
