// SPDX-License-Identifier: MIT

//! Request context carried through one invocation

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A file received with the request and saved to disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    /// Form field name
    pub name: String,
    #[serde(default)]
    pub filename: String,
    pub path: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Incoming request data visible to expressions as `request.*`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    /// Lower-cased header names
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
    #[serde(default)]
    pub ip: String,
    /// Request id
    #[serde(default)]
    pub id: String,
    /// Filled in by the engine when empty
    #[serde(default)]
    pub session_id: String,
}

impl RequestContext {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse a context supplied as JSON, e.g. on the command line
    pub fn from_json(value: Value) -> Result<Self, EngineError> {
        let mut ctx: Self = serde_json::from_value(value)
            .map_err(|e| EngineError::RequestContextType(e.to_string()))?;
        ctx.method = ctx.method.to_ascii_uppercase();
        ctx.headers = ctx
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Ok(ctx)
    }

    /// Mint a session id when none was supplied; returns true if minted
    pub fn ensure_session_id(&mut self) -> bool {
        if self.session_id.is_empty() {
            self.session_id = uuid::Uuid::new_v4().to_string();
            true
        } else {
            false
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Match a request path against a route pattern.
///
/// `*` matches one segment; a trailing `/*` matches any remainder.
pub fn route_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim_end_matches('/');
    let path = path.trim_end_matches('/');

    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix || path.starts_with(&format!("{}/", prefix)) || prefix.is_empty();
    }

    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();
    pattern_parts.len() == path_parts.len()
        && pattern_parts
            .iter()
            .zip(&path_parts)
            .all(|(p, s)| *p == "*" || p == s)
}
