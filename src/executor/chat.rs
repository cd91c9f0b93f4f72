// SPDX-License-Identifier: MIT

//! Chat completion against an Ollama-compatible `/api/chat` endpoint

use super::{process::timeout_from, Executor};
use crate::engine::ExecutionState;
use crate::error::BackendError;
use crate::workflow::ChatConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

pub struct ChatExecutor {
    client: Client,
    base_url: String,
}

impl ChatExecutor {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(config: &ChatConfig) -> Value {
        let mut messages: Vec<Value> = config
            .scenario
            .iter()
            .map(|m| json!({"role": m.role, "content": m.prompt}))
            .collect();
        messages.push(json!({
            "role": config.role.as_deref().unwrap_or("user"),
            "content": config.prompt,
        }));

        let mut body = json!({
            "model": config.model,
            "messages": messages,
            "stream": false,
        });
        if config.json_response {
            body["format"] = json!("json");
        }

        let mut options = Map::new();
        if let Some(t) = config.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = config.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

#[async_trait]
impl Executor<ChatConfig> for ChatExecutor {
    async fn execute(
        &self,
        config: &ChatConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        if config.model.trim().is_empty() {
            return Err(BackendError::invalid_config("chat.model is required"));
        }
        let base = config
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or(self.base_url.as_str());
        let url = format!("{}/api/chat", base);
        let body = Self::request_body(config);

        log::debug!(
            "Chat request body: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let mut request = self.client.post(&url).json(&body);
        if let Some(timeout) = timeout_from(config.timeout_duration.as_deref())? {
            request = request.timeout(timeout);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(BackendError::remote(
                "chat backend",
                format!("{}: {}", status, text),
            ));
        }

        let resp_json: Value = resp.json().await?;
        if let Some(error) = resp_json.get("error").and_then(Value::as_str) {
            return Err(BackendError::remote("chat backend", error));
        }

        let content = resp_json
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::remote("chat backend", "response has no message"))?;
        let response = if config.json_response {
            serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
        } else {
            Value::String(content.to_string())
        };

        Ok(json!({
            "response": response,
            "model": resp_json.get("model").cloned().unwrap_or_else(|| json!(config.model)),
        }))
    }
}
