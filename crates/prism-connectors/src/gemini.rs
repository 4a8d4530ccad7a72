// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini connector.
//!
//! Speaks the native `generateContent` / `streamGenerateContent` endpoints
//! and converts responses to the OpenAI shape before returning, so the
//! rest of the pipeline sees one format.  The public variant authenticates
//! with `x-goog-api-key`; OAuth variants substitute a bearer token plus
//! project-scoped tenancy headers.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::debug;

use prism_config::IdentityConfig;
use prism_domain::{
    BackendResponse, ByteStream, ChatRequest, ProxyError, ResponseEnvelope,
    StreamingResponseEnvelope,
};
use prism_translate::gemini as wire;

use crate::connector::Connector;

enum GeminiAuth {
    /// `x-goog-api-key: <key>` — public Generative Language API.
    ApiKey(String),
    /// `Authorization: Bearer <token>` with an optional project id header.
    OAuth { access_token: String, project: Option<String> },
}

pub struct GeminiConnector {
    name: String,
    auth: GeminiAuth,
    base_url: String,
    client: reqwest::Client,
    available_models: RwLock<Vec<String>>,
}

impl GeminiConnector {
    pub fn new(api_key: String, base_url: Option<String>, timeout_seconds: u64) -> Self {
        Self::build("gemini", GeminiAuth::ApiKey(api_key), base_url, timeout_seconds)
    }

    /// OAuth-personal / cloud-project tenancy variant.
    pub fn with_oauth(
        name: impl Into<String>,
        access_token: String,
        project: Option<String>,
        base_url: Option<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self::build(
            name,
            GeminiAuth::OAuth { access_token, project },
            base_url,
            timeout_seconds,
        )
    }

    fn build(
        name: impl Into<String>,
        auth: GeminiAuth,
        base_url: Option<String>,
        timeout_seconds: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            auth,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into())
                .trim_end_matches('/')
                .to_string(),
            client,
            available_models: RwLock::new(Vec::new()),
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            GeminiAuth::ApiKey(key) => builder.header("x-goog-api-key", key),
            GeminiAuth::OAuth { access_token, project } => {
                let builder = builder.bearer_auth(access_token);
                match project {
                    Some(project) => builder.header("x-goog-user-project", project),
                    None => builder,
                }
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProxyError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let response = self
            .apply_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("could not connect to Gemini: {e}")))?;
        if !response.status().is_success() {
            return Err(ProxyError::backend_with_status(
                format!("Gemini model listing failed: {}", response.status()),
                "gemini_error",
                response.status().as_u16(),
            ));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("unparseable Gemini model list: {e}")))?;
        let mut models: Vec<String> = body["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|name| name.strip_prefix("models/").unwrap_or(name).to_string())
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        Ok(models)
    }

    async fn unary(
        &self,
        model_url: &str,
        payload: &serde_json::Value,
        effective_model: &str,
    ) -> Result<BackendResponse, ProxyError> {
        let url = format!("{model_url}:generateContent");
        let response = self
            .apply_auth(self.client.post(&url))
            .json(payload)
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("could not connect to Gemini: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProxyError::backend_with_status(
                detail,
                "gemini_error",
                status.as_u16(),
            ));
        }
        let headers = header_map(&response);
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::backend(format!("unparseable Gemini response: {e}")))?;
        let content = wire::response_to_openai(&data, effective_model);
        let usage = content.get("usage").cloned();
        Ok(BackendResponse::Unary(ResponseEnvelope {
            content,
            headers,
            status_code: status.as_u16(),
            usage,
            metadata: None,
        }))
    }

    async fn streaming(
        &self,
        model_url: &str,
        payload: &serde_json::Value,
        effective_model: &str,
    ) -> Result<BackendResponse, ProxyError> {
        let url = format!("{model_url}:streamGenerateContent?alt=sse");
        let response = self
            .apply_auth(self.client.post(&url))
            .json(payload)
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("could not connect to Gemini: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProxyError::backend_with_status(
                format!("Gemini stream error: {status} - {detail}"),
                "gemini_error",
                status.as_u16(),
            ));
        }
        let headers = header_map(&response);
        let model = effective_model.to_string();

        // Convert each complete Gemini SSE line into an OpenAI delta chunk,
        // carrying partial lines across TCP chunks, and close with the
        // `[DONE]` sentinel.
        let byte_stream = response.bytes_stream();
        let converted = byte_stream
            .map(|chunk| chunk.map_err(|e| ProxyError::backend(format!("gemini stream error: {e}"))))
            .scan(String::new(), move |buf, chunk| {
                let frames: Vec<Result<Bytes, ProxyError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut out = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(data) = line.strip_prefix("data:") {
                                let data = data.trim();
                                if data.is_empty() || data == "[DONE]" {
                                    continue;
                                }
                                if let Ok(v) = serde_json::from_str::<serde_json::Value>(data) {
                                    let converted = wire::stream_chunk_to_openai(&v, &model);
                                    out.push(Ok(Bytes::from(format!("data: {converted}\n\n"))));
                                }
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(e)],
                };
                std::future::ready(Some(frames))
            })
            .flat_map(futures::stream::iter)
            .chain(futures::stream::once(async {
                Ok(Bytes::from_static(b"data: [DONE]\n\n"))
            }));

        let stream: ByteStream = Box::pin(converted);
        let mut envelope = StreamingResponseEnvelope::new(stream);
        envelope.headers = headers;
        Ok(BackendResponse::Streaming(envelope))
    }
}

fn header_map(response: &reqwest::Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

#[async_trait]
impl Connector for GeminiConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), ProxyError> {
        // Models are fetched on first use; nothing to do eagerly.
        Ok(())
    }

    fn get_available_models(&self) -> Vec<String> {
        self.available_models
            .try_read()
            .map(|models| models.clone())
            .unwrap_or_default()
    }

    async fn get_available_models_async(&self) -> Result<Vec<String>, ProxyError> {
        let models = self.fetch_models().await?;
        *self.available_models.write().await = models.clone();
        Ok(models)
    }

    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        identity: Option<&IdentityConfig>,
    ) -> Result<BackendResponse, ProxyError> {
        let payload = wire::build_payload(request);
        let model_name = wire::normalize_model_name(effective_model);
        let model_url = format!("{}/v1beta/models/{}", self.base_url, model_name);

        debug!(
            backend = %self.name,
            model = %model_name,
            stream = request.stream,
            "sending Gemini request"
        );
        // Identity attribution headers are an OpenRouter concept; Gemini
        // has no equivalent, so identity is intentionally unused here.
        let _ = identity;

        if request.stream {
            self.streaming(&model_url, &payload, effective_model).await
        } else {
            self.unary(&model_url, &payload, effective_model).await
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
