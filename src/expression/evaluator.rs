//! Expression evaluator
//!
//! Evaluation is a pure function of the parsed expression and a [`Scope`].
//! The evaluator itself holds only the function table, so one instance is
//! shared across every invocation.

use super::ast::{BinaryOp, Expression, Literal, UnaryOp};
use super::functions::FunctionRegistry;
use super::parser::parse_guard;
use super::template::{Segment, Template};
use crate::error::ExpressionError;
use once_cell::sync::Lazy;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

static EMPTY_SESSION: Lazy<Map<String, Value>> = Lazy::new(Map::new);

/// Roots that never name a resource
pub const RESERVED_ROOTS: &[&str] = &["request", "session", "env"];

/// Everything an expression may read during one invocation
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    outputs: &'a HashMap<String, Value>,
    request: Option<&'a Value>,
    session: &'a Map<String, Value>,
    writes: Option<&'a Mutex<Map<String, Value>>>,
    writable: bool,
}

impl<'a> Scope<'a> {
    pub fn new(outputs: &'a HashMap<String, Value>) -> Self {
        Self {
            outputs,
            request: None,
            session: &EMPTY_SESSION,
            writes: None,
            writable: false,
        }
    }

    pub fn with_request(mut self, request: Option<&'a Value>) -> Self {
        self.request = request;
        self
    }

    pub fn with_session(mut self, session: &'a Map<String, Value>) -> Self {
        self.session = session;
        self
    }

    /// Make earlier session writes visible without allowing new ones
    pub fn with_pending_writes(mut self, writes: &'a Mutex<Map<String, Value>>) -> Self {
        self.writes = Some(writes);
        self.writable = false;
        self
    }

    /// Allow `set()`; writes land in `writes`
    pub fn with_writes(mut self, writes: &'a Mutex<Map<String, Value>>) -> Self {
        self.writes = Some(writes);
        self.writable = true;
        self
    }

    pub fn output(&self, action_id: &str) -> Option<&'a Value> {
        self.outputs.get(action_id)
    }

    pub fn request(&self) -> Result<&'a Value, ExpressionError> {
        self.request.ok_or(ExpressionError::NoRequestContext)
    }

    pub fn has_request(&self) -> bool {
        self.request.is_some()
    }

    /// Session value, preferring writes made earlier in this invocation
    pub fn session_get(&self, key: &str) -> Option<Value> {
        if let Some(writes) = self.writes {
            let guard = writes.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(v) = guard.get(key) {
                return Some(v.clone());
            }
        }
        self.session.get(key).cloned()
    }

    pub fn session_snapshot(&self) -> Map<String, Value> {
        let mut merged = self.session.clone();
        if let Some(writes) = self.writes {
            let guard = writes.lock().unwrap_or_else(|p| p.into_inner());
            for (k, v) in guard.iter() {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    pub fn set_session(&self, key: &str, value: Value) -> Result<(), ExpressionError> {
        let writes = self.writes.filter(|_| self.writable).ok_or_else(|| {
            ExpressionError::invalid_argument("set", "only allowed in expr blocks")
        })?;
        let mut guard = writes.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(key.to_string(), value);
        Ok(())
    }
}

/// Stateless evaluator over a shared function table
#[derive(Clone)]
pub struct Evaluator {
    functions: Arc<FunctionRegistry>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_functions(FunctionRegistry::with_builtins())
    }

    pub fn with_functions(functions: FunctionRegistry) -> Self {
        Self {
            functions: Arc::new(functions),
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Parse and evaluate a bare expression
    pub fn evaluate(&self, expr: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        let parsed = parse_guard(expr)?;
        self.eval(&parsed, scope)
    }

    /// Render a template string. A lone `{{ expr }}` keeps its type;
    /// anything else becomes a string.
    pub fn render(&self, template: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        if !template.contains("{{") {
            return Ok(Value::String(template.to_string()));
        }
        let parsed = Template::parse(template)?;
        self.render_template(&parsed, scope)
    }

    pub fn render_template(
        &self,
        template: &Template,
        scope: &Scope<'_>,
    ) -> Result<Value, ExpressionError> {
        if let Some(expr) = template.single_expression() {
            return self.eval(expr, scope);
        }
        let mut out = String::new();
        for segment in template.segments() {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(e) => out.push_str(&to_text(&self.eval(e, scope)?)),
            }
        }
        Ok(Value::String(out))
    }

    /// Render every string inside a JSON value; object keys stay as written
    pub fn render_value(&self, value: &Value, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.render(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a parsed expression
    pub fn eval(&self, expr: &Expression, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        match expr {
            Expression::Literal(lit) => literal_value(lit),
            Expression::Array(items) => items
                .iter()
                .map(|e| self.eval(e, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expression::Ident(name) => resolve_root(name, scope),
            Expression::Member(base, field) => {
                let value = self.eval(base, scope)?;
                match value {
                    Value::Object(mut map) => map
                        .remove(field)
                        .ok_or_else(|| unresolved(expr)),
                    _ => Err(unresolved(expr)),
                }
            }
            Expression::Index(base, index) => {
                let value = self.eval(base, scope)?;
                let key = self.eval(index, scope)?;
                match (value, &key) {
                    (Value::Array(mut items), Value::Number(n)) => {
                        let i = n
                            .as_f64()
                            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                            .map(|f| f as usize)
                            .ok_or_else(|| {
                                ExpressionError::TypeMismatch(format!("bad array index {}", n))
                            })?;
                        if i < items.len() {
                            Ok(items.swap_remove(i))
                        } else {
                            Err(unresolved(expr))
                        }
                    }
                    (Value::Object(mut map), Value::String(k)) => {
                        map.remove(k).ok_or_else(|| unresolved(expr))
                    }
                    (Value::Array(_), _) | (Value::Object(_), _) => Err(
                        ExpressionError::TypeMismatch(format!("cannot index with {}", key)),
                    ),
                    _ => Err(unresolved(expr)),
                }
            }
            Expression::Call(name, args) => self.call(name, args, scope),
            Expression::Unary(op, inner) => {
                let value = self.eval(inner, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                    UnaryOp::Neg => {
                        let n = value.as_f64().ok_or_else(|| {
                            ExpressionError::TypeMismatch(format!("cannot negate {}", value))
                        })?;
                        number(-n)
                    }
                }
            }
            Expression::Binary(left, op, right) => self.binary(left, *op, right, scope),
            Expression::Ternary(cond, then, otherwise) => {
                if is_truthy(&self.eval(cond, scope)?) {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
        }
    }

    fn call(
        &self,
        name: &str,
        args: &[Expression],
        scope: &Scope<'_>,
    ) -> Result<Value, ExpressionError> {
        // `default` needs its first argument unevaluated so a missing path
        // can fall back instead of failing
        if name == "default" {
            if args.len() != 2 {
                return Err(ExpressionError::invalid_argument(
                    "default",
                    "expects 2 arguments",
                ));
            }
            return match self.eval(&args[0], scope) {
                Ok(Value::Null) | Err(ExpressionError::UnresolvedPath(_)) => {
                    self.eval(&args[1], scope)
                }
                other => other,
            };
        }

        let function = self
            .functions
            .get(name)
            .ok_or_else(|| ExpressionError::UnknownFunction(name.to_string()))?;
        let values = args
            .iter()
            .map(|a| self.eval(a, scope))
            .collect::<Result<Vec<_>, _>>()?;
        (**function)(&values, scope)
    }

    fn binary(
        &self,
        left: &Expression,
        op: BinaryOp,
        right: &Expression,
        scope: &Scope<'_>,
    ) -> Result<Value, ExpressionError> {
        match op {
            BinaryOp::And => {
                let l = self.eval(left, scope)?;
                if !is_truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(is_truthy(&self.eval(right, scope)?)));
            }
            BinaryOp::Or => {
                let l = self.eval(left, scope)?;
                if is_truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(is_truthy(&self.eval(right, scope)?)));
            }
            _ => {}
        }

        let l = self.eval(left, scope)?;
        let r = self.eval(right, scope)?;
        match op {
            BinaryOp::Add => match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => number(as_f64(a) + as_f64(b)),
                (Value::String(_), _) | (_, Value::String(_)) => {
                    Ok(Value::String(format!("{}{}", to_text(&l), to_text(&r))))
                }
                (Value::Array(a), Value::Array(b)) => {
                    Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
                }
                _ => Err(mismatch(op, &l, &r)),
            },
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                let (a, b) = match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(mismatch(op, &l, &r)),
                };
                match op {
                    BinaryOp::Sub => number(a - b),
                    BinaryOp::Mul => number(a * b),
                    _ if b == 0.0 => Err(ExpressionError::TypeMismatch(
                        "division by zero".to_string(),
                    )),
                    BinaryOp::Div => number(a / b),
                    _ => number(a % b),
                }
            }
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r))),
            BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
                let ordering = match (&l, &r) {
                    (Value::Number(a), Value::Number(b)) => as_f64(a).partial_cmp(&as_f64(b)),
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                }
                .ok_or_else(|| mismatch(op, &l, &r))?;
                Ok(Value::Bool(match op {
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Gte => ordering.is_ge(),
                    BinaryOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }))
            }
            BinaryOp::Contains => Ok(Value::Bool(match (&l, &r) {
                (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
                (Value::String(s), other) => s.contains(&to_text(other)),
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                _ => false,
            })),
            BinaryOp::And => Ok(Value::Bool(is_truthy(&l) && is_truthy(&r))),
            BinaryOp::Or => Ok(Value::Bool(is_truthy(&l) || is_truthy(&r))),
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_root(name: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match name {
        "request" => scope.request().cloned(),
        "session" => Ok(Value::Object(scope.session_snapshot())),
        "env" => Ok(Value::Object(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, Value::String(v.into_string().ok()?))))
                .collect(),
        )),
        id => {
            let output = scope
                .output(id)
                .ok_or_else(|| ExpressionError::UnknownReference(id.to_string()))?;
            let mut view = Map::new();
            view.insert("output".to_string(), output.clone());
            view.insert("actionId".to_string(), Value::String(id.to_string()));
            Ok(Value::Object(view))
        }
    }
}

fn literal_value(lit: &Literal) -> Result<Value, ExpressionError> {
    match lit {
        Literal::String(s) => Ok(Value::String(s.clone())),
        Literal::Number(n) => number(*n),
        Literal::Boolean(b) => Ok(Value::Bool(*b)),
        Literal::Null => Ok(Value::Null),
    }
}

fn unresolved(expr: &Expression) -> ExpressionError {
    ExpressionError::UnresolvedPath(expr.path().unwrap_or_else(|| "<expression>".to_string()))
}

fn mismatch(op: BinaryOp, l: &Value, r: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch(format!(
        "cannot apply '{}' to {} and {}",
        op,
        type_name(l),
        type_name(r)
    ))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

/// Build a JSON number, preferring integers when the value is whole
pub fn number(n: f64) -> Result<Value, ExpressionError> {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::TypeMismatch(format!("{} is not a finite number", n)))
}

/// Truthiness used by conditions and logical operators
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text form used when a value is spliced into a larger string
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => (as_f64(x) - as_f64(y)).abs() < f64::EPSILON,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: Vec<(&str, Value)>) -> HashMap<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_plain_text_unchanged() {
        let out = HashMap::new();
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(
            ev.render("just text, no braces", &scope).unwrap(),
            json!("just text, no braces")
        );
        assert_eq!(ev.render("", &scope).unwrap(), json!(""));
    }

    #[test]
    fn test_single_template_keeps_type() {
        let out = outputs(vec![("rows", json!([{"id": 1}, {"id": 2}]))]);
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(
            ev.render("{{ rows.output }}", &scope).unwrap(),
            json!([{"id": 1}, {"id": 2}])
        );
        assert_eq!(ev.render("{{ rows.output[1].id }}", &scope).unwrap(), json!(2));
        assert_eq!(ev.render("{{ rows.actionId }}", &scope).unwrap(), json!("rows"));
    }

    #[test]
    fn test_mixed_template_stringifies() {
        let out = outputs(vec![
            ("user", json!({"name": "Ada", "tags": ["x"]})),
            ("none", Value::Null),
        ]);
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(
            ev.render("Hi {{ user.output.name }}: {{ user.output.tags }}", &scope)
                .unwrap(),
            json!("Hi Ada: [\"x\"]")
        );
        assert_eq!(
            ev.render("[{{ none.output }}]", &scope).unwrap(),
            json!("[]")
        );
    }

    #[test]
    fn test_arithmetic_and_concat() {
        let out = HashMap::new();
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(ev.evaluate("1 + 2 * 3", &scope).unwrap(), json!(7));
        assert_eq!(ev.evaluate("7 / 2", &scope).unwrap(), json!(3.5));
        assert_eq!(ev.evaluate("7 % 4", &scope).unwrap(), json!(3));
        assert_eq!(ev.evaluate("-(2 - 5)", &scope).unwrap(), json!(3));
        assert_eq!(ev.evaluate("'n=' + 4", &scope).unwrap(), json!("n=4"));
        assert!(ev.evaluate("1 / 0", &scope).is_err());
        assert!(ev.evaluate("true - 1", &scope).is_err());
    }

    #[test]
    fn test_comparisons_and_logic() {
        let out = outputs(vec![("score", json!(0.9)), ("tags", json!(["bug"]))]);
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(
            ev.evaluate("score.output > 0.8 && tags.output contains 'bug'", &scope)
                .unwrap(),
            json!(true)
        );
        assert_eq!(
            ev.evaluate("score.output < 0.5 or not true", &scope).unwrap(),
            json!(false)
        );
        assert_eq!(ev.evaluate("'abc' < 'abd'", &scope).unwrap(), json!(true));
        assert_eq!(ev.evaluate("1 == 1.0", &scope).unwrap(), json!(true));
        assert_eq!(ev.evaluate("null != 0", &scope).unwrap(), json!(true));
        assert_eq!(
            ev.evaluate("score.output >= 1 ? 'high' : 'low'", &scope)
                .unwrap(),
            json!("low")
        );
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        let out = HashMap::new();
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(
            ev.evaluate("false && missing.output", &scope).unwrap(),
            json!(false)
        );
        assert_eq!(
            ev.evaluate("true || missing.output", &scope).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_unknown_reference() {
        let out = HashMap::new();
        let scope = Scope::new(&out);
        let err = Evaluator::new().render("{{ ghost.output }}", &scope).unwrap_err();
        assert_eq!(err, ExpressionError::UnknownReference("ghost".into()));
    }

    #[test]
    fn test_unresolved_path() {
        let out = outputs(vec![("a", json!({"x": 1}))]);
        let scope = Scope::new(&out);
        let err = Evaluator::new().evaluate("a.output.y", &scope).unwrap_err();
        assert_eq!(err, ExpressionError::UnresolvedPath("a.output.y".into()));
    }

    #[test]
    fn test_default_falls_back() {
        let out = outputs(vec![("a", json!({"x": null}))]);
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        assert_eq!(
            ev.evaluate("default(a.output.y, 'fallback')", &scope).unwrap(),
            json!("fallback")
        );
        assert_eq!(
            ev.evaluate("default(a.output.x, 5)", &scope).unwrap(),
            json!(5)
        );
        // unknown resources still fail
        assert!(ev.evaluate("default(zzz.output, 1)", &scope).is_err());
    }

    #[test]
    fn test_request_without_context() {
        let out = HashMap::new();
        let scope = Scope::new(&out);
        let err = Evaluator::new()
            .evaluate("request.method", &scope)
            .unwrap_err();
        assert_eq!(err, ExpressionError::NoRequestContext);
    }

    #[test]
    fn test_request_paths() {
        let out = HashMap::new();
        let request = json!({
            "method": "POST",
            "headers": {"x-user": "7"},
            "query": {"q": "rust"},
            "body": {"items": [10, 20]}
        });
        let scope = Scope::new(&out).with_request(Some(&request));
        let ev = Evaluator::new();
        assert_eq!(ev.evaluate("request.method", &scope).unwrap(), json!("POST"));
        assert_eq!(
            ev.evaluate("request.headers['x-user']", &scope).unwrap(),
            json!("7")
        );
        assert_eq!(
            ev.render("q={{ request.query.q }}", &scope).unwrap(),
            json!("q=rust")
        );
        assert_eq!(
            ev.evaluate("request.body.items[1] + 1", &scope).unwrap(),
            json!(21)
        );
    }

    #[test]
    fn test_set_requires_writes() {
        let out = HashMap::new();
        let session = Map::new();
        let scope = Scope::new(&out).with_session(&session);
        let ev = Evaluator::new();
        assert!(ev.evaluate("set('k', 1)", &scope).is_err());

        let writes = Mutex::new(Map::new());
        let scope = scope.with_writes(&writes);
        ev.evaluate("set('k', 1 + 1)", &scope).unwrap();
        assert_eq!(ev.evaluate("session.k", &scope).unwrap(), json!(2));
        assert_eq!(writes.lock().unwrap().get("k"), Some(&json!(2)));
    }

    #[test]
    fn test_render_value_recurses() {
        let out = outputs(vec![("a", json!("v"))]);
        let scope = Scope::new(&out);
        let rendered = Evaluator::new()
            .render_value(
                &json!({"k": "{{ a.output }}", "list": ["x-{{ a.output }}", 3], "{{ key }}": true}),
                &scope,
            )
            .unwrap();
        assert_eq!(
            rendered,
            json!({"k": "v", "list": ["x-v", 3], "{{ key }}": true})
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn test_deterministic() {
        let out = outputs(vec![("a", json!({"n": 3}))]);
        let scope = Scope::new(&out);
        let ev = Evaluator::new();
        let first = ev.render("{{ a.output.n * 2 }} items", &scope).unwrap();
        let second = ev.render("{{ a.output.n * 2 }} items", &scope).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!("6 items"));
    }
}
