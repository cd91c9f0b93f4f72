// SPDX-License-Identifier: MIT

//! Typed error handling for agentrun
//!
//! Each layer has its own error enum: the expression language, executor
//! backends, workflow loading, and the engine itself. `EngineError` is the
//! one callers see; it carries the offending action id wherever one exists.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while parsing or evaluating `{{ }}` expressions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// Malformed expression or template
    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    /// Root identifier names no executed resource
    #[error("unknown reference '{0}'")]
    UnknownReference(String),

    /// Field path does not exist in the referenced value
    #[error("path '{0}' does not resolve")]
    UnresolvedPath(String),

    /// `request.*` used while no request context is attached
    #[error("no request context attached to this invocation")]
    NoRequestContext,

    /// Operator applied to values of the wrong type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid argument to {function}(): {message}")]
    InvalidArgument { function: String, message: String },
}

impl ExpressionError {
    pub fn syntax(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Syntax {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

/// Failures reported by executor backends
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Subprocess finished with a non-zero exit code
    #[error("process exited with code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Remote service answered with an error payload
    #[error("{service} returned an error: {message}")]
    Remote { service: String, message: String },
}

impl BackendError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn remote(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            service: service.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while reading a workflow file
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("workflow file not found: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid workflow YAML")]
    Yaml(#[from] serde_yaml::Error),
}

/// Programmatic classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    SchemaValidation,
    DependencyCycle,
    UnknownActionReference,
    ExpressionSyntax,
    ExpressionEvaluation,
    ExecutorNotAvailable,
    ExecutorExecution,
    RequestContextType,
    PreflightFailed,
    TargetNotExecuted,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SchemaValidation => "SchemaValidation",
            ErrorKind::DependencyCycle => "DependencyCycle",
            ErrorKind::UnknownActionReference => "UnknownActionReference",
            ErrorKind::ExpressionSyntax => "ExpressionSyntax",
            ErrorKind::ExpressionEvaluation => "ExpressionEvaluation",
            ErrorKind::ExecutorNotAvailable => "ExecutorNotAvailable",
            ErrorKind::ExecutorExecution => "ExecutorExecution",
            ErrorKind::RequestContextType => "RequestContextType",
            ErrorKind::PreflightFailed => "PreflightFailed",
            ErrorKind::TargetNotExecuted => "TargetNotExecuted",
            ErrorKind::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

fn at(action_id: &Option<String>) -> String {
    match action_id {
        Some(id) => format!(" in resource '{}'", id),
        None => String::new(),
    }
}

/// Render `err` followed by each of its causes, separated by `: `
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        message.push_str(": ");
        message.push_str(&e.to_string());
        cause = e.source();
    }
    message
}

/// Top-level error type for validation and execution
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schema validation failed{}: {message}", at(.action_id))]
    SchemaValidation {
        action_id: Option<String>,
        message: String,
    },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("resource '{action_id}' references unknown action '{reference}'")]
    UnknownActionReference { action_id: String, reference: String },

    #[error("expression syntax error{}", at(.action_id))]
    ExpressionSyntax {
        action_id: Option<String>,
        #[source]
        source: ExpressionError,
    },

    #[error("expression evaluation failed{}", at(.action_id))]
    ExpressionEvaluation {
        action_id: Option<String>,
        #[source]
        source: ExpressionError,
    },

    #[error("no executor registered for run kind '{kind}' (resource '{action_id}')")]
    ExecutorNotAvailable { kind: String, action_id: String },

    #[error("{kind} executor failed in resource '{action_id}'")]
    ExecutorExecution {
        kind: String,
        action_id: String,
        #[source]
        source: BackendError,
    },

    #[error("invalid request context: {0}")]
    RequestContextType(String),

    #[error("preflight check failed in resource '{action_id}' ({code}): {message}")]
    PreflightFailed {
        action_id: String,
        code: u16,
        message: String,
    },

    #[error("target resource '{action_id}' was skipped and produced no output")]
    TargetNotExecuted { action_id: String },

    #[error("execution cancelled{}", at(.action_id))]
    Cancelled { action_id: Option<String> },
}

impl EngineError {
    pub fn schema(action_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            action_id: action_id.map(str::to_string),
            message: message.into(),
        }
    }

    /// Wrap an expression failure, keeping syntax errors distinct and
    /// promoting unknown references to their own kind
    pub fn from_expression(action_id: &str, err: ExpressionError) -> Self {
        match err {
            ExpressionError::Syntax { .. } => Self::ExpressionSyntax {
                action_id: Some(action_id.to_string()),
                source: err,
            },
            ExpressionError::UnknownReference(reference) => Self::UnknownActionReference {
                action_id: action_id.to_string(),
                reference,
            },
            other => Self::ExpressionEvaluation {
                action_id: Some(action_id.to_string()),
                source: other,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            Self::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            Self::UnknownActionReference { .. } => ErrorKind::UnknownActionReference,
            Self::ExpressionSyntax { .. } => ErrorKind::ExpressionSyntax,
            Self::ExpressionEvaluation { .. } => ErrorKind::ExpressionEvaluation,
            Self::ExecutorNotAvailable { .. } => ErrorKind::ExecutorNotAvailable,
            Self::ExecutorExecution { .. } => ErrorKind::ExecutorExecution,
            Self::RequestContextType(_) => ErrorKind::RequestContextType,
            Self::PreflightFailed { .. } => ErrorKind::PreflightFailed,
            Self::TargetNotExecuted { .. } => ErrorKind::TargetNotExecuted,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// The resource the error is attributed to, if any
    pub fn action_id(&self) -> Option<&str> {
        match self {
            Self::SchemaValidation { action_id, .. }
            | Self::ExpressionSyntax { action_id, .. }
            | Self::ExpressionEvaluation { action_id, .. }
            | Self::Cancelled { action_id } => action_id.as_deref(),
            Self::DependencyCycle { cycle } => cycle.first().map(String::as_str),
            Self::UnknownActionReference { action_id, .. }
            | Self::ExecutorNotAvailable { action_id, .. }
            | Self::ExecutorExecution { action_id, .. }
            | Self::PreflightFailed { action_id, .. }
            | Self::TargetNotExecuted { action_id } => Some(action_id),
            Self::RequestContextType(_) => None,
        }
    }
}
