// SPDX-License-Identifier: MIT

use super::{SessionData, SessionStore};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Sessions persisted in a SQLite table, surviving restarts
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);";

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, BackendError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("Session store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    pub fn in_memory(ttl: Duration) -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionData>, BackendError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock();
        conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, session_id: &str, data: SessionData) -> Result<(), BackendError> {
        let expires = Utc::now().timestamp_millis() + self.ttl.as_millis() as i64;
        let text = serde_json::to_string(&data)?;
        self.lock().execute(
            "INSERT INTO sessions (id, data, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at",
            params![session_id, text, expires],
        )?;
        Ok(())
    }

    async fn merge(&self, session_id: &str, writes: SessionData) -> Result<(), BackendError> {
        let now = Utc::now().timestamp_millis();
        let expires = now + self.ttl.as_millis() as i64;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT data FROM sessions WHERE id = ?1 AND expires_at > ?2",
                params![session_id, now],
                |row| row.get(0),
            )
            .optional()?;
        let mut data: SessionData = match raw {
            Some(text) => serde_json::from_str(&text)?,
            None => SessionData::new(),
        };
        data.extend(writes);
        tx.execute(
            "INSERT INTO sessions (id, data, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at",
            params![session_id, serde_json::to_string(&data)?, expires],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), BackendError> {
        self.lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip() {
        let store = SqliteSessionStore::in_memory(Duration::from_secs(60)).unwrap();
        let mut data = SessionData::new();
        data.insert("name".into(), json!("Ada"));
        store.set("s1", data).await.unwrap();

        let got = store.get("s1").await.unwrap().unwrap();
        assert_eq!(got.get("name"), Some(&json!("Ada")));
        assert!(store.get("s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let store = SqliteSessionStore::in_memory(Duration::from_secs(60)).unwrap();
        let mut data = SessionData::new();
        data.insert("n".into(), json!(1));
        store.set("s", data.clone()).await.unwrap();
        data.insert("n".into(), json!(2));
        store.set("s", data).await.unwrap();
        assert_eq!(
            store.get("s").await.unwrap().unwrap().get("n"),
            Some(&json!(2))
        );

        store.delete("s").await.unwrap();
        assert!(store.get("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_keeps_unwritten_keys() {
        let store = SqliteSessionStore::in_memory(Duration::from_secs(60)).unwrap();
        let mut first = SessionData::new();
        first.insert("x".into(), json!(1));
        store.merge("s", first).await.unwrap();
        let mut second = SessionData::new();
        second.insert("y".into(), json!(2));
        store.merge("s", second).await.unwrap();

        let got = store.get("s").await.unwrap().unwrap();
        assert_eq!(got.get("x"), Some(&json!(1)));
        assert_eq!(got.get("y"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = SqliteSessionStore::in_memory(Duration::from_millis(10)).unwrap();
        store.set("s", SessionData::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SqliteSessionStore::open(&path, Duration::from_secs(60)).unwrap();
            let mut data = SessionData::new();
            data.insert("k".into(), json!(true));
            store.set("s", data).await.unwrap();
        }
        let store = SqliteSessionStore::open(&path, Duration::from_secs(60)).unwrap();
        assert!(store.get("s").await.unwrap().is_some());
    }
}
