// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory session store.
//!
//! Sessions are held behind per-session locks: a single logical session
//! permits at most one in-flight mutation at a time, while reads always
//! return the latest committed state.  Eviction is time-based on
//! `last_active_at`; there is no cross-process sharing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

use prism_domain::Session;

pub struct SessionService {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    ttl_seconds: u64,
}

impl SessionService {
    pub fn new(ttl_seconds: u64) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), ttl_seconds }
    }

    /// Handle to the locked slot for `id`, creating the session on first
    /// use.  Holding the returned guard serializes mutations for that
    /// session; drop it to commit.
    pub async fn lock_session(&self, id: &str) -> OwnedMutexGuard<Session> {
        let slot = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(id.to_string())
                .or_insert_with(|| {
                    debug!(session_id = %id, "creating session");
                    Arc::new(Mutex::new(Session::new(id)))
                })
                .clone()
        };
        slot.lock_owned().await
    }

    /// Latest committed snapshot of the session, creating it on first use.
    pub async fn get_session(&self, id: &str) -> Session {
        self.lock_session(id).await.clone()
    }

    /// Like [`get_session`], generating a fresh id when none is supplied.
    pub async fn get_or_create_session(&self, id: Option<&str>) -> Session {
        match id {
            Some(id) if !id.is_empty() => self.get_session(id).await,
            _ => {
                let id = Uuid::new_v4().to_string();
                self.get_session(&id).await
            }
        }
    }

    /// Replace the stored session with `session` (matched by id).
    pub async fn update_session(&self, session: Session) {
        let mut guard = self.lock_session(&session.id).await;
        *guard = session;
    }

    /// Returns `true` when a session existed and was removed.
    pub async fn delete_session(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Snapshot of every live session.
    pub async fn get_all_sessions(&self) -> Vec<Session> {
        let slots: Vec<Arc<Mutex<Session>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out
    }

    /// Drop sessions idle longer than the TTL.  Returns the eviction count.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut expired: Vec<String> = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, slot) in sessions.iter() {
                let session = slot.lock().await;
                let idle = now
                    .signed_duration_since(session.last_active_at)
                    .num_seconds();
                if idle >= 0 && idle as u64 > self.ttl_seconds {
                    expired.push(id.clone());
                }
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &expired {
            debug!(session_id = %id, "evicting idle session");
            sessions.remove(id);
        }
        expired.len()
    }

    /// Spawn a background task that evicts idle sessions periodically.
    pub fn start_eviction_task(self: &Arc<Self>, interval_seconds: u64) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
            loop {
                ticker.tick().await;
                let evicted = service.evict_expired().await;
                if evicted > 0 {
                    debug!(count = evicted, "session eviction pass");
                }
            }
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prism_domain::SessionInteraction;

    #[tokio::test]
    async fn get_session_creates_on_first_use() {
        let service = SessionService::new(3600);
        let session = service.get_session("s1").await;
        assert_eq!(session.id, "s1");
        assert_eq!(service.get_all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_generates_fresh_ids() {
        let service = SessionService::new(3600);
        let a = service.get_or_create_session(None).await;
        let b = service.get_or_create_session(None).await;
        assert_ne!(a.id, b.id);
        assert_eq!(service.get_all_sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn update_is_visible_to_subsequent_reads() {
        let service = SessionService::new(3600);
        let mut session = service.get_session("s1").await;
        session.state = session.state.with_hello_requested(true);
        service.update_session(session).await;
        assert!(service.get_session("s1").await.state.hello_requested);
    }

    #[tokio::test]
    async fn delete_returns_whether_session_existed() {
        let service = SessionService::new(3600);
        service.get_session("s1").await;
        assert!(service.delete_session("s1").await);
        assert!(!service.delete_session("s1").await);
    }

    #[tokio::test]
    async fn eviction_removes_only_idle_sessions() {
        let service = SessionService::new(60);
        let mut stale = service.get_session("stale").await;
        stale.last_active_at = Utc::now() - chrono::Duration::seconds(120);
        service.update_session(stale).await;
        service.get_session("fresh").await;

        let evicted = service.evict_expired().await;
        assert_eq!(evicted, 1);
        let remaining = service.get_all_sessions().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "fresh");
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized_per_session() {
        let service = Arc::new(SessionService::new(3600));
        service.get_session("s1").await;

        let mut tasks = Vec::new();
        for i in 0..32 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                let mut guard = service.lock_session("s1").await;
                guard.add_interaction(SessionInteraction::proxy(format!("p{i}")));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(service.get_session("s1").await.history.len(), 32);
    }

    #[tokio::test]
    async fn lock_session_serializes_state_swaps() {
        // A reader between two locked mutations must observe either the
        // old or the new state, never a torn intermediate.
        let service = Arc::new(SessionService::new(3600));
        {
            let mut guard = service.lock_session("s1").await;
            let state = guard.state.with_project(Some("a".into()));
            guard.update_state(state);
        }
        let snapshot = service.get_session("s1").await;
        assert_eq!(snapshot.state.project.as_deref(), Some("a"));
    }
}
