// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared implementation for OpenAI-compatible chat completion APIs.
//!
//! OpenAI, OpenRouter, ZhipuAI and the Qwen OAuth backend all speak the
//! same `/chat/completions` + `/models` wire format; each configures this
//! connector with its own defaults.  Streaming responses forward the raw
//! SSE bytes; the response middleware chain does any rewriting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use prism_config::IdentityConfig;
use prism_domain::{
    BackendResponse, ByteStream, ChatRequest, ProxyError, ResponseEnvelope,
    StreamingResponseEnvelope,
};

use crate::connector::Connector;

pub struct OpenAICompatConnector {
    name: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
    available_models: RwLock<Vec<String>>,
    health_checked: AtomicBool,
    health_check_enabled: bool,
}

impl OpenAICompatConnector {
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout_seconds: u64,
        health_check_enabled: bool,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            available_models: RwLock::new(Vec::new()),
            health_checked: AtomicBool::new(false),
            health_check_enabled,
        }
    }

    pub fn openai(api_key: Option<String>, base_url: Option<String>, timeout: u64, health: bool) -> Self {
        Self::new(
            "openai",
            api_key,
            base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            timeout,
            health,
        )
    }

    pub fn openrouter(api_key: Option<String>, base_url: Option<String>, timeout: u64, health: bool) -> Self {
        Self::new(
            "openrouter",
            api_key,
            base_url.unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            timeout,
            health,
        )
    }

    /// ZhipuAI GLM models behind the OpenAI-compatible endpoint.
    pub fn zai(api_key: Option<String>, base_url: Option<String>, timeout: u64, health: bool) -> Self {
        Self::new(
            "zai",
            api_key,
            base_url.unwrap_or_else(|| "https://open.bigmodel.cn/api/paas/v4".into()),
            timeout,
            health,
        )
    }

    fn bearer(&self) -> Result<&str, ProxyError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProxyError::authentication(format!("{} API key not set", self.name)))
    }

    /// One-shot liveness probe before the first live request.
    async fn ensure_healthy(&self, bearer: &str, base_url: &str) -> Result<(), ProxyError> {
        if !self.health_check_enabled || self.health_checked.load(Ordering::Relaxed) {
            return Ok(());
        }
        let url = format!("{base_url}/models");
        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("{} health check failed: {e}", self.name)))?;
        if !response.status().is_success() {
            return Err(ProxyError::backend_with_status(
                format!("{} health check returned {}", self.name, response.status()),
                "health_check_failed",
                response.status().as_u16(),
            ));
        }
        self.health_checked.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn fetch_models(&self, bearer: &str, base_url: &str) -> Result<Vec<String>, ProxyError> {
        let url = format!("{base_url}/models");
        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("could not reach {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ProxyError::backend_with_status(
                format!("{} model listing failed", self.name),
                "model_list_failed",
                response.status().as_u16(),
            ));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("unparseable model list: {e}")))?;
        let mut models: Vec<String> = body["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|m| m["id"].as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        Ok(models)
    }

    /// Issue the chat-completions request against `base_url` with the
    /// given bearer token.  Identity headers are attached per call and
    /// cleared implicitly when no identity is supplied.
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        identity: Option<&IdentityConfig>,
        bearer: &str,
        base_url: &str,
    ) -> Result<BackendResponse, ProxyError> {
        self.ensure_healthy(bearer, base_url).await?;

        let payload = prism_translate::openai::build_payload(request, effective_model);
        let url = format!("{base_url}/chat/completions");

        debug!(
            backend = %self.name,
            model = %effective_model,
            stream = request.stream,
            message_count = request.messages.len(),
            "sending chat completion request"
        );

        let mut builder = self.client.post(&url).bearer_auth(bearer).json(&payload);
        if let Some(identity) = identity {
            builder = builder
                .header("HTTP-Referer", &identity.url)
                .header("X-Title", &identity.title);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("could not connect to {}: {e}", self.name)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 {
                return Err(ProxyError::authentication(format!(
                    "{} rejected credentials: {text}",
                    self.name
                )));
            }
            return Err(ProxyError::backend_with_status(
                format!("{} error {status}: {text}", self.name),
                "upstream_error",
                status.as_u16(),
            ));
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();

        if request.stream {
            let name = self.name.clone();
            let stream: ByteStream = Box::pin(response.bytes_stream().map(move |chunk| {
                chunk.map_err(|e| ProxyError::backend(format!("{name} stream error: {e}")))
            }));
            let mut envelope = StreamingResponseEnvelope::new(stream);
            envelope.headers = headers;
            return Ok(BackendResponse::Streaming(envelope));
        }

        let content: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("{} returned unparseable JSON: {e}", self.name)))?;
        let usage = content.get("usage").cloned();
        Ok(BackendResponse::Unary(ResponseEnvelope {
            content,
            headers,
            status_code: status.as_u16(),
            usage,
            metadata: None,
        }))
    }
}

#[async_trait]
impl Connector for OpenAICompatConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), ProxyError> {
        // Lazy by design: models are fetched on demand, nothing blocks
        // startup.  A missing key only fails once traffic arrives.
        if self.api_key.is_none() {
            warn!(backend = %self.name, "no API key configured");
        }
        Ok(())
    }

    fn get_available_models(&self) -> Vec<String> {
        // Cached snapshot; may be empty until the async refresh ran.
        self.available_models
            .try_read()
            .map(|models| models.clone())
            .unwrap_or_default()
    }

    async fn get_available_models_async(&self) -> Result<Vec<String>, ProxyError> {
        let bearer = self.bearer()?.to_string();
        let models = self.fetch_models(&bearer, &self.base_url).await?;
        *self.available_models.write().await = models.clone();
        Ok(models)
    }

    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        identity: Option<&IdentityConfig>,
    ) -> Result<BackendResponse, ProxyError> {
        let bearer = self.bearer()?.to_string();
        self.dispatch(request, effective_model, identity, &bearer, &self.base_url)
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
