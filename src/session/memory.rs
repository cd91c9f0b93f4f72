// SPDX-License-Identifier: MIT

use super::{SessionData, SessionStore};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct Entry {
    data: SessionData,
    expires_at: DateTime<Utc>,
}

/// Process-local sessions with an idle TTL
#[derive(Clone)]
pub struct InMemorySessionStore {
    ttl: chrono::Duration,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30)),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn evict_expired(&self) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            log::debug!("Evicted {} expired session(s)", evicted);
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionData>, BackendError> {
        self.evict_expired().await;
        let entries = self.entries.read().await;
        Ok(entries.get(session_id).map(|e| e.data.clone()))
    }

    async fn set(&self, session_id: &str, data: SessionData) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            session_id.to_string(),
            Entry {
                data,
                expires_at: Utc::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn merge(&self, session_id: &str, writes: SessionData) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| Entry {
                data: SessionData::new(),
                expires_at: now,
            });
        if entry.expires_at <= now {
            entry.data.clear();
        }
        entry.data.extend(writes);
        entry.expires_at = now + self.ttl;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), BackendError> {
        self.entries.write().await.remove(session_id);
        Ok(())
    }
}
