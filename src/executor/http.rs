// SPDX-License-Identifier: MIT

use super::{process::timeout_from, Executor};
use crate::engine::ExecutionState;
use crate::error::BackendError;
use crate::workflow::{HttpAuth, HttpClientConfig};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client backend. Non-2xx responses are returned, not raised.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor<HttpClientConfig> for HttpExecutor {
    async fn execute(
        &self,
        config: &HttpClientConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                BackendError::invalid_config(format!("invalid HTTP method '{}'", config.method))
            })?;
        let url = url::Url::parse(&config.url)
            .map_err(|e| BackendError::invalid_config(format!("invalid url '{}': {}", config.url, e)))?;
        let timeout = timeout_from(config.timeout_duration.as_deref())?.unwrap_or(DEFAULT_TIMEOUT);

        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(timeout)
            .query(&config.params);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match &config.auth {
            Some(HttpAuth::Bearer { token }) => request.bearer_auth(token),
            Some(HttpAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        };
        request = match &config.data {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(data) => request.json(data),
        };

        log::debug!("http: {} {}", method, config.url);
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(timeout)
            } else {
                BackendError::Http(e)
            }
        })?;

        let status = resp.status().as_u16();
        let headers: Map<String, Value> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let text = resp.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(json!({
            "statusCode": status,
            "headers": headers,
            "body": body,
        }))
    }
}
