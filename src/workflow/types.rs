// SPDX-License-Identifier: MIT

//! YAML schema types for workflow and resource definitions
//!
//! A workflow is a named set of resources plus the action id of the one
//! whose output answers the invocation. Every resource declares exactly one
//! primary run kind; see [`RunConfig::primary`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Top-level workflow definition
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Workflow {
    /// Look up a resource by action id
    pub fn resource(&self, action_id: &str) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.metadata.action_id == action_id)
    }

    pub fn target(&self) -> &str {
        &self.metadata.target_action_id
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    /// Resource whose output becomes the invocation output
    #[serde(default)]
    pub target_action_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default)]
    pub api_server_mode: bool,
    #[serde(default)]
    pub web_server_mode: bool,
    pub api_server: Option<ApiServerSettings>,
    pub web_server: Option<WebServerSettings>,
    #[serde(default)]
    pub agent_settings: AgentSettings,
    /// Named database connections usable via `sql.connectionName`
    #[serde(default)]
    pub sql_connections: HashMap<String, SqlConnection>,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerSettings {
    #[serde(default = "default_host")]
    pub host_ip: String,
    #[serde(default = "default_port")]
    pub port_num: u32,
    #[serde(default)]
    pub routes: Vec<ApiRoute>,
}

impl Default for ApiServerSettings {
    fn default() -> Self {
        Self {
            host_ip: default_host(),
            port_num: default_port(),
            routes: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u32 {
    3000
}

/// A path served by the API surface; empty `methods` accepts any method
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ApiRoute {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebServerSettings {
    /// Static routes are mounted on the API listener; these are informational
    pub host_ip: Option<String>,
    pub port_num: Option<u32>,
    #[serde(default)]
    pub routes: Vec<WebRoute>,
}

/// Static directory mounted under `path`
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WebRoute {
    pub path: String,
    pub public_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    pub timezone: Option<String>,
    pub python_version: Option<String>,
    #[serde(default)]
    pub python_packages: Vec<String>,
    pub requirements_file: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    pub ollama_url: Option<String>,
    /// Extra environment passed to exec and python resources
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SqlConnection {
    pub connection: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// "memory" (default) or "sqlite"
    #[serde(rename = "type")]
    pub store_type: Option<String>,
    /// Database path for the sqlite store
    pub path: Option<String>,
    /// Idle lifetime such as "30m"
    pub ttl: Option<String>,
}

impl SessionSettings {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

    pub fn ttl(&self) -> Duration {
        self.ttl
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Self::DEFAULT_TTL)
    }
}

/// A single executable step
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Resource {
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub run: RunConfig,
}

impl Resource {
    pub fn new(action_id: &str, run: RunConfig) -> Self {
        Self {
            metadata: ResourceMetadata {
                action_id: action_id.to_string(),
                name: action_id.to_string(),
                description: None,
                requires: Vec::new(),
            },
            run,
        }
    }

    pub fn action_id(&self) -> &str {
        &self.metadata.action_id
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(default)]
    pub action_id: String,
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    /// Explicit ordering edges on top of expression references
    #[serde(default)]
    pub requires: Vec<String>,
}

/// Run configuration: guards plus the run-kind blocks as written in YAML
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrict_to_http_methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrict_to_routes: Vec<String>,
    /// Skip the resource when any of these expressions is truthy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_condition: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight_check: Option<PreflightCheck>,
    /// Expressions evaluated after the primary step; `set()` is allowed here
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expr: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_client: Option<HttpClientConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<SqlConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<PythonConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_response: Option<ApiResponseConfig>,
}

/// The primary step of a resource, borrowed from its [`RunConfig`]
#[derive(Debug, Clone, Copy)]
pub enum RunKind<'a> {
    HttpClient(&'a HttpClientConfig),
    Sql(&'a SqlConfig),
    Python(&'a PythonConfig),
    Exec(&'a ExecConfig),
    Chat(&'a ChatConfig),
    ApiResponse(&'a ApiResponseConfig),
}

impl RunKind<'_> {
    /// Registry key for this kind
    pub fn name(&self) -> &'static str {
        match self {
            RunKind::HttpClient(_) => "http",
            RunKind::Sql(_) => "sql",
            RunKind::Python(_) => "python",
            RunKind::Exec(_) => "exec",
            RunKind::Chat(_) => "chat",
            RunKind::ApiResponse(_) => "apiResponse",
        }
    }

    /// Config block as a JSON value, for scanning embedded templates
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            RunKind::HttpClient(c) => serde_json::to_value(c),
            RunKind::Sql(c) => serde_json::to_value(c),
            RunKind::Python(c) => serde_json::to_value(c),
            RunKind::Exec(c) => serde_json::to_value(c),
            RunKind::Chat(c) => serde_json::to_value(c),
            RunKind::ApiResponse(c) => serde_json::to_value(c),
        }
    }
}

impl RunConfig {
    /// The single primary step, or a description of what is wrong
    pub fn primary(&self) -> Result<RunKind<'_>, String> {
        let mut found = Vec::new();
        if let Some(c) = &self.http_client {
            found.push(RunKind::HttpClient(c));
        }
        if let Some(c) = &self.sql {
            found.push(RunKind::Sql(c));
        }
        if let Some(c) = &self.python {
            found.push(RunKind::Python(c));
        }
        if let Some(c) = &self.exec {
            found.push(RunKind::Exec(c));
        }
        if let Some(c) = &self.chat {
            found.push(RunKind::Chat(c));
        }
        if let Some(c) = &self.api_response {
            found.push(RunKind::ApiResponse(c));
        }

        match found.as_slice() {
            [kind] => Ok(*kind),
            [] => Err(
                "run must declare one of httpClient, sql, python, exec, chat, apiResponse"
                    .to_string(),
            ),
            many => Err(format!(
                "run declares {} primary kinds ({}); exactly one is allowed",
                many.len(),
                many.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
            )),
        }
    }

    pub fn http(config: HttpClientConfig) -> Self {
        Self {
            http_client: Some(config),
            ..Default::default()
        }
    }

    pub fn sql(config: SqlConfig) -> Self {
        Self {
            sql: Some(config),
            ..Default::default()
        }
    }

    pub fn python(config: PythonConfig) -> Self {
        Self {
            python: Some(config),
            ..Default::default()
        }
    }

    pub fn exec(config: ExecConfig) -> Self {
        Self {
            exec: Some(config),
            ..Default::default()
        }
    }

    pub fn chat(config: ChatConfig) -> Self {
        Self {
            chat: Some(config),
            ..Default::default()
        }
    }

    pub fn api_response(response: Value) -> Self {
        Self {
            api_response: Some(ApiResponseConfig {
                success: true,
                response,
                meta: None,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheck {
    #[serde(default)]
    pub validations: Vec<String>,
    pub error: Option<PreflightError>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PreflightError {
    #[serde(default = "default_preflight_code")]
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

fn default_preflight_code() -> u16 {
    400
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpClientConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// JSON body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HttpAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SqlConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    /// Database path, `sqlite://path`, or `:memory:`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<NamedQuery>,
    /// Run `queries` inside one transaction
    #[serde(default)]
    pub transaction: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PythonConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub prompt: String,
    /// Prior turns sent ahead of `prompt`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenario: Vec<ChatMessage>,
    #[serde(default)]
    pub json_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Overrides the backend URL the registry was configured with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponseConfig {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub response: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Parse durations such as `30s`, `5m`, `1h`, `250ms`, or bare seconds
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<f64>() {
        return seconds(secs);
    }

    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: f64 = number.parse().ok()?;
    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "s" | "sec" => value,
        "m" | "min" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        _ => return None,
    };
    seconds(secs)
}

/// Negative, non-finite, and out-of-range values are not durations
fn seconds(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}
