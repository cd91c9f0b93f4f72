// SPDX-License-Identifier: MIT

//! Session storage keyed by session id
//!
//! The engine loads a session's data at the start of an invocation and
//! merges whatever `set()` calls produced back into the store once it
//! succeeds, so concurrent invocations on one session only overwrite the
//! keys they wrote.

mod memory;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

use crate::error::BackendError;
use crate::workflow::SessionSettings;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub type SessionData = Map<String, Value>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Data stored for `session_id`, if any and not expired
    async fn get(&self, session_id: &str) -> Result<Option<SessionData>, BackendError>;

    /// Replace the data stored for `session_id` and refresh its expiry
    async fn set(&self, session_id: &str, data: SessionData) -> Result<(), BackendError>;

    /// Apply `writes` key by key onto whatever is currently stored for
    /// `session_id`, atomically with respect to other merges, and refresh
    /// its expiry. Keys not named in `writes` keep their stored values.
    async fn merge(&self, session_id: &str, writes: SessionData) -> Result<(), BackendError>;

    async fn delete(&self, session_id: &str) -> Result<(), BackendError>;
}

/// Build the store a workflow's `settings.session` asks for
pub fn store_from_settings(
    settings: &SessionSettings,
) -> Result<Arc<dyn SessionStore>, BackendError> {
    let ttl = settings.ttl();
    match settings.store_type.as_deref().unwrap_or("memory") {
        "memory" => Ok(Arc::new(InMemorySessionStore::new(ttl))),
        "sqlite" => {
            let path = settings.path.as_deref().unwrap_or("sessions.db");
            Ok(Arc::new(SqliteSessionStore::open(path, ttl)?))
        }
        other => Err(BackendError::invalid_config(format!(
            "unknown session store type '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_store_is_memory() {
        let store = store_from_settings(&SessionSettings::default()).unwrap();
        store.set("s", SessionData::new()).await.unwrap();
        assert!(store.get("s").await.unwrap().is_some());
    }

    #[test]
    fn test_unknown_store_type() {
        let settings = SessionSettings {
            store_type: Some("redis".into()),
            ..Default::default()
        };
        assert!(store_from_settings(&settings).is_err());
    }
}
