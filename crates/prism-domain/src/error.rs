// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Domain error taxonomy.
//!
//! Connectors and the pipeline raise these errors only; HTTP-framework or
//! client-library errors never cross the crate boundary.  The ingress
//! adapter maps each variant to an HTTP status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Ingress validation failure — maps to 400.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
        code: Option<String>,
    },

    /// Missing or invalid credentials — maps to 401.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Upstream non-2xx or unparseable response.  The upstream status is
    /// passed through when informative, else the ingress maps to 502.
    #[error("backend error: {message}")]
    Backend {
        message: String,
        code: Option<String>,
        status_code: Option<u16>,
    },

    /// Network or connect failure — maps to 503.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Reactor registry misuse; programmer error — maps to 500.
    #[error("tool call reactor error: {0}")]
    ToolCallReactor(String),
}

impl ProxyError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into(), param: None, code: None }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into(), code: None, status_code: None }
    }

    pub fn backend_with_status(message: impl Into<String>, code: impl Into<String>, status_code: u16) -> Self {
        Self::Backend {
            message: message.into(),
            code: Some(code.into()),
            status_code: Some(status_code),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    /// HTTP status the ingress adapter should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::Authentication(_) => 401,
            Self::Backend { status_code, .. } => match status_code {
                Some(s) if *s >= 400 => *s,
                _ => 502,
            },
            Self::ServiceUnavailable(_) => 503,
            Self::ToolCallReactor(_) => 500,
        }
    }

    /// Whether a failover route may retry the next element after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::ServiceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_maps_to_400() {
        assert_eq!(ProxyError::invalid_request("x").http_status(), 400);
    }

    #[test]
    fn authentication_maps_to_401() {
        assert_eq!(ProxyError::authentication("no key").http_status(), 401);
    }

    #[test]
    fn backend_passes_informative_status_through() {
        let err = ProxyError::backend_with_status("rate limited", "rl", 429);
        assert_eq!(err.http_status(), 429);
    }

    #[test]
    fn backend_without_status_maps_to_502() {
        assert_eq!(ProxyError::backend("unparseable").http_status(), 502);
    }

    #[test]
    fn unavailable_maps_to_503() {
        assert_eq!(ProxyError::unavailable("connect refused").http_status(), 503);
    }

    #[test]
    fn only_backend_and_unavailable_are_retryable() {
        assert!(ProxyError::backend("x").is_retryable());
        assert!(ProxyError::unavailable("x").is_retryable());
        assert!(!ProxyError::authentication("x").is_retryable());
        assert!(!ProxyError::invalid_request("x").is_retryable());
    }
}
