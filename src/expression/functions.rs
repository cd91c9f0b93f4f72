// SPDX-License-Identifier: MIT

//! Function table for expression calls
//!
//! Callers extend the language by registering closures before building an
//! [`Evaluator`](super::Evaluator). `default` is handled by the evaluator
//! itself and cannot be overridden.

use super::evaluator::{number, to_text, Scope};
use crate::error::ExpressionError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub type Function =
    Arc<dyn Fn(&[Value], &Scope<'_>) -> Result<Value, ExpressionError> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl FunctionRegistry {
    /// An empty table
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("len", builtin_len);
        registry.register("upper", |args, _| {
            Ok(Value::String(text_arg("upper", args)?.to_uppercase()))
        });
        registry.register("lower", |args, _| {
            Ok(Value::String(text_arg("lower", args)?.to_lowercase()))
        });
        registry.register("trim", |args, _| {
            Ok(Value::String(text_arg("trim", args)?.trim().to_string()))
        });
        registry.register("string", |args, _| {
            Ok(Value::String(text_arg("string", args)?))
        });
        registry.register("json", builtin_json);
        registry.register("parseJson", builtin_parse_json);
        registry.register("split", builtin_split);
        registry.register("join", builtin_join);
        registry.register("env", |args, _| {
            let name = text_arg("env", args)?;
            Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
        });
        registry.register("now", |_, _| {
            Ok(Value::String(chrono::Utc::now().to_rfc3339()))
        });
        registry.register("output", builtin_output);
        registry.register("get", builtin_get);
        registry.register("session", |args, scope| {
            let key = text_arg("session", args)?;
            Ok(scope.session_get(&key).unwrap_or(Value::Null))
        });
        registry.register("set", builtin_set);
        registry
    }

    /// Add or replace a function
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[Value], &Scope<'_>) -> Result<Value, ExpressionError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn arity(function: &str, args: &[Value], expected: usize) -> Result<(), ExpressionError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ExpressionError::invalid_argument(
            function,
            format!("expects {} argument(s), got {}", expected, args.len()),
        ))
    }
}

fn text_arg(function: &str, args: &[Value]) -> Result<String, ExpressionError> {
    arity(function, args, 1)?;
    Ok(to_text(&args[0]))
}

fn builtin_len(args: &[Value], _: &Scope<'_>) -> Result<Value, ExpressionError> {
    arity("len", args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::Null => 0,
        other => {
            return Err(ExpressionError::invalid_argument(
                "len",
                format!("no length for {}", other),
            ))
        }
    };
    number(n as f64)
}

fn builtin_json(args: &[Value], _: &Scope<'_>) -> Result<Value, ExpressionError> {
    arity("json", args, 1)?;
    serde_json::to_string(&args[0])
        .map(Value::String)
        .map_err(|e| ExpressionError::invalid_argument("json", e.to_string()))
}

fn builtin_parse_json(args: &[Value], _: &Scope<'_>) -> Result<Value, ExpressionError> {
    let text = text_arg("parseJson", args)?;
    serde_json::from_str(&text)
        .map_err(|e| ExpressionError::invalid_argument("parseJson", e.to_string()))
}

fn builtin_split(args: &[Value], _: &Scope<'_>) -> Result<Value, ExpressionError> {
    arity("split", args, 2)?;
    let text = to_text(&args[0]);
    let sep = to_text(&args[1]);
    Ok(Value::Array(
        text.split(sep.as_str())
            .map(|s| Value::String(s.to_string()))
            .collect(),
    ))
}

fn builtin_join(args: &[Value], _: &Scope<'_>) -> Result<Value, ExpressionError> {
    arity("join", args, 2)?;
    let items = args[0].as_array().ok_or_else(|| {
        ExpressionError::invalid_argument("join", "first argument must be an array")
    })?;
    let sep = to_text(&args[1]);
    Ok(Value::String(
        items.iter().map(to_text).collect::<Vec<_>>().join(&sep),
    ))
}

fn builtin_output(args: &[Value], scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    let id = text_arg("output", args)?;
    scope
        .output(&id)
        .cloned()
        .ok_or(ExpressionError::UnknownReference(id))
}

/// Look a name up in query, body, headers, then session
fn builtin_get(args: &[Value], scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    let name = text_arg("get", args)?;
    if let Ok(request) = scope.request() {
        if let Some(v) = request.get("query").and_then(|q| q.get(&name)) {
            return Ok(v.clone());
        }
        if let Some(v) = request.get("body").and_then(|b| b.get(&name)) {
            return Ok(v.clone());
        }
        if let Some(v) = request
            .get("headers")
            .and_then(|h| h.get(name.to_ascii_lowercase()))
        {
            return Ok(v.clone());
        }
    }
    Ok(scope.session_get(&name).unwrap_or(Value::Null))
}

fn builtin_set(args: &[Value], scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    arity("set", args, 2)?;
    let key = to_text(&args[0]);
    if key.is_empty() {
        return Err(ExpressionError::invalid_argument("set", "key must not be empty"));
    }
    scope.set_session(&key, args[1].clone())?;
    Ok(args[1].clone())
}
