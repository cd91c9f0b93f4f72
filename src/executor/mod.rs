// SPDX-License-Identifier: MIT

//! Executor backends and the registry that maps run kinds to them
//!
//! Every kind except `apiResponse` needs a backend. Backends receive
//! configuration with all `{{ }}` templates already rendered.

mod chat;
mod exec;
mod http;
mod process;
mod python;
mod sql;

pub use chat::ChatExecutor;
pub use exec::ExecExecutor;
pub use http::HttpExecutor;
pub use python::PythonExecutor;
pub use sql::SqlExecutor;

use crate::config::AppConfig;
use crate::engine::ExecutionState;
use crate::error::BackendError;
use crate::workflow::{ChatConfig, ExecConfig, HttpClientConfig, PythonConfig, SqlConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A backend for one run kind
#[async_trait]
pub trait Executor<C>: Send + Sync
where
    C: Send + Sync,
{
    async fn execute(&self, config: &C, state: &ExecutionState) -> Result<Value, BackendError>;
}

pub type HttpBackend = Arc<dyn Executor<HttpClientConfig>>;
pub type SqlBackend = Arc<dyn Executor<SqlConfig>>;
pub type PythonBackend = Arc<dyn Executor<PythonConfig>>;
pub type ExecBackend = Arc<dyn Executor<ExecConfig>>;
pub type ChatBackend = Arc<dyn Executor<ChatConfig>>;

/// Optional backend per run kind. Unset kinds fail at dispatch time.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    http: Option<HttpBackend>,
    sql: Option<SqlBackend>,
    python: Option<PythonBackend>,
    exec: Option<ExecBackend>,
    chat: Option<ChatBackend>,
}

impl ExecutorRegistry {
    /// Registry with no backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every real backend wired up
    pub fn with_defaults(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        registry.set_http_executor(Arc::new(HttpExecutor::new()));
        registry.set_sql_executor(Arc::new(SqlExecutor::new()));
        registry.set_python_executor(Arc::new(PythonExecutor::new(&config.python_bin)));
        registry.set_exec_executor(Arc::new(ExecExecutor::new()));
        registry.set_llm_executor(&config.ollama_url);
        registry
    }

    pub fn set_http_executor(&mut self, executor: HttpBackend) {
        self.http = Some(executor);
    }

    pub fn set_sql_executor(&mut self, executor: SqlBackend) {
        self.sql = Some(executor);
    }

    pub fn set_python_executor(&mut self, executor: PythonBackend) {
        self.python = Some(executor);
    }

    pub fn set_exec_executor(&mut self, executor: ExecBackend) {
        self.exec = Some(executor);
    }

    /// Register the Ollama-backed chat executor for `backend_url`
    pub fn set_llm_executor(&mut self, backend_url: &str) {
        self.chat = Some(Arc::new(ChatExecutor::new(backend_url)));
    }

    pub fn set_chat_executor(&mut self, executor: ChatBackend) {
        self.chat = Some(executor);
    }

    pub fn http(&self) -> Option<&HttpBackend> {
        self.http.as_ref()
    }

    pub fn sql(&self) -> Option<&SqlBackend> {
        self.sql.as_ref()
    }

    pub fn python(&self) -> Option<&PythonBackend> {
        self.python.as_ref()
    }

    pub fn exec(&self) -> Option<&ExecBackend> {
        self.exec.as_ref()
    }

    pub fn chat(&self) -> Option<&ChatBackend> {
        self.chat.as_ref()
    }

    /// Whether `kind` (as named by `RunKind::name`) can be dispatched
    pub fn has(&self, kind: &str) -> bool {
        match kind {
            "http" => self.http.is_some(),
            "sql" => self.sql.is_some(),
            "python" => self.python.is_some(),
            "exec" => self.exec.is_some(),
            "chat" => self.chat.is_some(),
            "apiResponse" => true,
            _ => false,
        }
    }
}
