// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OAuth credential lifecycle.
//!
//! Credentials live in a single JSON file under the provider's per-user
//! directory (`~/.qwen/oauth_creds.json` for Qwen).  The file is read by
//! anyone but written with exclusive-writer semantics: refresh writes a
//! temp file and renames it into place.  A file watcher (with an mtime
//! check as fallback) picks up external changes — e.g. the provider CLI
//! re-authenticating — and re-validates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use prism_domain::ProxyError;

/// Proactive refresh window: refresh once within this many seconds of
/// expiry.
pub const REFRESH_SKEW_SECONDS: i64 = 30;

/// Shape of the on-disk credentials file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthCredentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub expiry_date: Option<i64>,
    /// Tenant-specific API host (`host[/path]`), without scheme.
    #[serde(default)]
    pub resource_url: Option<String>,
}

impl OAuthCredentials {
    /// Structured list of validation problems; empty means usable.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.access_token.trim().is_empty() {
            errors.push("missing access_token".to_string());
        }
        if self.refresh_token.trim().is_empty() {
            errors.push("missing refresh_token".to_string());
        }
        if let Some(expiry) = self.expiry_date {
            if expiry <= Utc::now().timestamp_millis() {
                errors.push("token expired".to_string());
            }
        }
        errors
    }

    /// Expired, or within the proactive refresh window of expiring.
    /// A missing expiry date means the token does not expire.
    pub fn needs_refresh(&self) -> bool {
        match self.expiry_date {
            Some(expiry_ms) => {
                let now_ms = Utc::now().timestamp_millis();
                now_ms >= expiry_ms - REFRESH_SKEW_SECONDS * 1000
            }
            None => false,
        }
    }

    /// `https://{resource_url}/v1` when a tenant host is present.
    pub fn api_base_url(&self) -> Option<String> {
        self.resource_url
            .as_ref()
            .filter(|r| !r.is_empty())
            .map(|r| format!("https://{}/v1", r.trim_end_matches('/')))
    }
}

/// `~/.qwen/oauth_creds.json`
pub fn default_credentials_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".qwen")
        .join("oauth_creds.json")
}

pub fn load_credentials(path: &Path) -> Result<OAuthCredentials, ProxyError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::authentication(format!("cannot read credentials at {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        ProxyError::authentication(format!("malformed credentials at {}: {e}", path.display()))
    })
}

/// Write the file atomically: temp file in the same directory, then
/// rename over the target.
pub fn save_credentials_atomic(path: &Path, credentials: &OAuthCredentials) -> Result<(), ProxyError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| ProxyError::authentication(format!("cannot create {}: {e}", parent.display())))?;
    let tmp = parent.join(".oauth_creds.json.tmp");
    let text = serde_json::to_string_pretty(credentials)
        .map_err(|e| ProxyError::authentication(format!("cannot serialize credentials: {e}")))?;
    std::fs::write(&tmp, text)
        .map_err(|e| ProxyError::authentication(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ProxyError::authentication(format!("cannot rename into {}: {e}", path.display())))?;
    Ok(())
}

// ─── Manager ──────────────────────────────────────────────────────────────────

/// Owns the in-memory credentials for the Qwen OAuth backend: loading,
/// validation, single-flight refresh, and write-back.
pub struct QwenOAuthManager {
    path: PathBuf,
    token_url: String,
    client: reqwest::Client,
    credentials: RwLock<Option<OAuthCredentials>>,
    /// Single-flight: the first waiter drives the refresh, the rest await
    /// the result.  Not cancellable.
    refresh_lock: Mutex<()>,
    last_mtime: Mutex<Option<SystemTime>>,
}

pub const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";

impl QwenOAuthManager {
    pub fn new(path: PathBuf, token_url: Option<String>) -> Self {
        Self {
            path,
            token_url: token_url.unwrap_or_else(|| QWEN_TOKEN_URL.to_string()),
            client: reqwest::Client::new(),
            credentials: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            last_mtime: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn credentials(&self) -> Option<OAuthCredentials> {
        self.credentials.read().await.clone()
    }

    /// Load from disk, skipping the read when mtime is unchanged.
    /// Returns the validation errors of whatever is now in memory.
    pub async fn load(&self) -> Vec<String> {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        {
            let mut last = self.last_mtime.lock().await;
            if mtime.is_some() && *last == mtime && self.credentials.read().await.is_some() {
                debug!("credentials file unchanged; using cached");
                return self
                    .credentials
                    .read()
                    .await
                    .as_ref()
                    .map(|c| c.validation_errors())
                    .unwrap_or_default();
            }
            *last = mtime;
        }

        match load_credentials(&self.path) {
            Ok(credentials) => {
                let errors = credentials.validation_errors();
                if let Some(base) = credentials.api_base_url() {
                    info!(base_url = %base, "qwen API base URL set from resource_url");
                }
                *self.credentials.write().await = Some(credentials);
                errors
            }
            Err(e) => {
                warn!(error = %e, "failed to load qwen OAuth credentials");
                *self.credentials.write().await = None;
                vec![e.to_string()]
            }
        }
    }

    /// Force a reload on the next access (used by the file watcher).
    pub async fn invalidate(&self) {
        *self.last_mtime.lock().await = None;
    }

    /// Refresh the access token when it is within the expiry window.
    ///
    /// Single-flight: concurrent callers serialize on the refresh lock and
    /// re-check expiry after acquiring it, so only one POST goes out.
    pub async fn refresh_if_needed(&self) -> Result<(), ProxyError> {
        {
            let credentials = self.credentials.read().await;
            match credentials.as_ref() {
                Some(c) if !c.needs_refresh() => return Ok(()),
                Some(_) => {}
                None => {
                    return Err(ProxyError::backend("No valid OAuth credentials"));
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // Re-check under the lock: another caller may have refreshed.
        let refresh_token = {
            let credentials = self.credentials.read().await;
            match credentials.as_ref() {
                Some(c) if !c.needs_refresh() => return Ok(()),
                Some(c) => c.refresh_token.clone(),
                None => return Err(ProxyError::backend("No valid OAuth credentials")),
            }
        };
        if refresh_token.is_empty() {
            return Err(ProxyError::authentication(
                "no refresh token available to perform refresh",
            ));
        }

        info!("access token expired or near expiry; refreshing");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProxyError::unavailable(format!("token refresh failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "token refresh rejected");
            return Err(ProxyError::authentication(format!(
                "token refresh rejected with {status}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::authentication(format!("malformed token response: {e}")))?;

        let mut updated = self
            .credentials
            .read()
            .await
            .clone()
            .unwrap_or(OAuthCredentials {
                access_token: String::new(),
                refresh_token: refresh_token.clone(),
                token_type: None,
                expiry_date: None,
                resource_url: None,
            });
        if let Some(token) = body["access_token"].as_str() {
            updated.access_token = token.to_string();
        }
        if let Some(token) = body["refresh_token"].as_str() {
            updated.refresh_token = token.to_string();
        }
        if let Some(token_type) = body["token_type"].as_str() {
            updated.token_type = Some(token_type.to_string());
        }
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);
        updated.expiry_date = Some(Utc::now().timestamp_millis() + expires_in * 1000);
        if let Some(resource) = body["resource_url"].as_str() {
            updated.resource_url = Some(resource.to_string());
        }

        save_credentials_atomic(&self.path, &updated)?;
        *self.credentials.write().await = Some(updated);
        info!("qwen OAuth token refreshed");
        Ok(())
    }
}

/// Watch the credentials file for external changes and reload.
///
/// Uses an OS-level notification watcher on the parent directory; when the
/// watcher cannot be created, falls back to mtime polling.  Reload shares
/// the manager's state with refresh, and validation failures surface via
/// the returned error list on the next `load`.
pub fn spawn_credentials_watcher(manager: Arc<QwenOAuthManager>) {
    use notify::Watcher;

    let path = manager.path().to_path_buf();
    let parent = path.parent().map(Path::to_path_buf);
    let (tx, rx) = std::sync::mpsc::channel::<()>();

    let watcher = parent.and_then(|dir| {
        let tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |event: Result<notify::Event, _>| {
            if event.is_ok() {
                let _ = tx.send(());
            }
        })
        .ok()?;
        watcher.watch(&dir, notify::RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    });

    if watcher.is_some() {
        let manager_for_events = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || {
            // Keep the watcher alive for the life of the loop.
            let _watcher = watcher;
            while rx.recv().is_ok() {
                let manager = Arc::clone(&manager_for_events);
                let handle = tokio::runtime::Handle::current();
                handle.spawn(async move {
                    manager.invalidate().await;
                    let errors = manager.load().await;
                    if !errors.is_empty() {
                        warn!(?errors, "credentials changed on disk and failed validation");
                    } else {
                        info!("credentials reloaded after file change");
                    }
                });
            }
        });
    } else {
        // Fall back to mtime polling.
        warn!("file watcher unavailable; falling back to mtime polling");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                ticker.tick().await;
                manager.load().await;
            }
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_credentials(expiry_offset_ms: i64) -> OAuthCredentials {
        OAuthCredentials {
            access_token: "at-123".into(),
            refresh_token: "rt-456".into(),
            token_type: Some("Bearer".into()),
            expiry_date: Some(Utc::now().timestamp_millis() + expiry_offset_ms),
            resource_url: Some("portal.qwen.ai".into()),
        }
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn valid_credentials_have_no_errors() {
        assert!(valid_credentials(3_600_000).validation_errors().is_empty());
    }

    #[test]
    fn missing_tokens_are_reported() {
        let creds = OAuthCredentials {
            access_token: String::new(),
            refresh_token: "  ".into(),
            token_type: None,
            expiry_date: None,
            resource_url: None,
        };
        let errors = creds.validation_errors();
        assert!(errors.contains(&"missing access_token".to_string()));
        assert!(errors.contains(&"missing refresh_token".to_string()));
    }

    #[test]
    fn expired_token_is_reported() {
        let errors = valid_credentials(-10_000).validation_errors();
        assert!(errors.contains(&"token expired".to_string()));
    }

    // ── Refresh window ────────────────────────────────────────────────────────

    #[test]
    fn token_within_skew_needs_refresh() {
        // expiry = now + 29s: inside the 30-second window.
        assert!(valid_credentials(29_000).needs_refresh());
    }

    #[test]
    fn token_beyond_skew_does_not_need_refresh() {
        assert!(!valid_credentials(120_000).needs_refresh());
    }

    #[test]
    fn expired_token_needs_refresh() {
        assert!(valid_credentials(-1).needs_refresh());
    }

    #[test]
    fn token_without_expiry_never_needs_refresh() {
        let mut creds = valid_credentials(0);
        creds.expiry_date = None;
        assert!(!creds.needs_refresh());
    }

    // ── Resource URL ──────────────────────────────────────────────────────────

    #[test]
    fn resource_url_expands_to_https_v1() {
        assert_eq!(
            valid_credentials(0).api_base_url().as_deref(),
            Some("https://portal.qwen.ai/v1")
        );
    }

    #[test]
    fn missing_resource_url_yields_none() {
        let mut creds = valid_credentials(0);
        creds.resource_url = None;
        assert!(creds.api_base_url().is_none());
    }

    // ── File round-trip ───────────────────────────────────────────────────────

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        let creds = valid_credentials(3_600_000);
        save_credentials_atomic(&path, &creds).unwrap();
        let loaded = load_credentials(&path).unwrap();
        assert_eq!(loaded, creds);
        // Atomic write leaves no temp file behind.
        assert!(!dir.path().join(".oauth_creds.json.tmp").exists());
    }

    #[test]
    fn load_missing_file_is_authentication_error() {
        let err = load_credentials(Path::new("/nonexistent/oauth_creds.json")).unwrap_err();
        assert!(matches!(err, ProxyError::Authentication(_)));
    }

    #[test]
    fn load_malformed_file_is_authentication_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_credentials(&path).unwrap_err(),
            ProxyError::Authentication(_)
        ));
    }

    #[test]
    fn wire_format_field_names_match_provider_cli() {
        // The file written by the provider CLI uses expiry_date (ms) and
        // resource_url; both must round-trip by those exact names.
        let json = r#"{
            "access_token": "a",
            "refresh_token": "r",
            "token_type": "Bearer",
            "expiry_date": 1999999999999,
            "resource_url": "host.example"
        }"#;
        let creds: OAuthCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.expiry_date, Some(1_999_999_999_999));
        let text = serde_json::to_string(&creds).unwrap();
        assert!(text.contains("\"expiry_date\""));
        assert!(text.contains("\"resource_url\""));
    }

    // ── Manager ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn manager_loads_and_caches_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        save_credentials_atomic(&path, &valid_credentials(3_600_000)).unwrap();

        let manager = QwenOAuthManager::new(path.clone(), None);
        assert!(manager.load().await.is_empty());
        assert!(manager.credentials().await.is_some());
        // Second load with unchanged mtime stays on the cached value.
        assert!(manager.load().await.is_empty());
    }

    #[tokio::test]
    async fn manager_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = QwenOAuthManager::new(dir.path().join("absent.json"), None);
        let errors = manager.load().await;
        assert!(!errors.is_empty());
        assert!(manager.credentials().await.is_none());
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        save_credentials_atomic(&path, &valid_credentials(3_600_000)).unwrap();
        // Unreachable token endpoint: if a refresh were attempted it would
        // fail, so success proves the fresh token short-circuits.
        let manager =
            QwenOAuthManager::new(path, Some("http://192.0.2.1:9/token".into()));
        manager.load().await;
        manager.refresh_if_needed().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_without_credentials_is_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = QwenOAuthManager::new(dir.path().join("absent.json"), None);
        manager.load().await;
        let err = manager.refresh_if_needed().await.unwrap_err();
        assert!(matches!(err, ProxyError::Backend { .. }));
        assert!(err.to_string().contains("No valid OAuth credentials"));
    }
}
