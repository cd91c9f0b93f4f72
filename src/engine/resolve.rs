//! Render a resource's primary config into its fully resolved form
//!
//! String fields always render to text. Only the positions listed per kind
//! keep the type a lone `{{ expr }}` evaluates to, e.g. an HTTP JSON body
//! or SQL bind parameters.

use crate::error::{EngineError, ExpressionError};
use crate::expression::{to_text, Evaluator, Scope};
use crate::workflow::{
    ApiResponseConfig, ChatConfig, ExecConfig, HttpClientConfig, PythonConfig, RunKind,
    SqlConfig, Workflow,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A primary step with every template rendered
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRun {
    Http(HttpClientConfig),
    Sql(SqlConfig),
    Python(PythonConfig),
    Exec(ExecConfig),
    Chat(ChatConfig),
    ApiResponse(ApiResponseConfig),
}

type TypedPath = fn(&[String]) -> bool;

fn http_typed(path: &[String]) -> bool {
    path.first().is_some_and(|k| k == "data")
}

fn sql_typed(path: &[String]) -> bool {
    match path {
        [first, ..] if first == "params" => true,
        [queries, _, params, ..] if queries == "queries" && params == "params" => true,
        _ => false,
    }
}

/// `meta` and the numeric or boolean fields deserialize from YAML as their
/// own types, so only `response` can carry a typed template
fn api_response_typed(path: &[String]) -> bool {
    path.first().is_some_and(|k| k == "response")
}

fn text_only(_: &[String]) -> bool {
    false
}

/// Render `kind` against `scope`, then apply workflow-level settings
pub fn resolve_run(
    kind: RunKind<'_>,
    action_id: &str,
    workflow: &Workflow,
    evaluator: &Evaluator,
    scope: &Scope<'_>,
) -> Result<ResolvedRun, EngineError> {
    let wrap = |e: ExpressionError| EngineError::from_expression(action_id, e);
    let agent = &workflow.settings.agent_settings;

    let resolved = match kind {
        RunKind::HttpClient(c) => {
            ResolvedRun::Http(render(c, evaluator, scope, http_typed).map_err(wrap)?)
        }
        RunKind::Sql(c) => {
            let mut sql: SqlConfig = render(c, evaluator, scope, sql_typed).map_err(wrap)?;
            if sql.connection.is_none() {
                if let Some(name) = &sql.connection_name {
                    let conn = workflow.settings.sql_connections.get(name).ok_or_else(|| {
                        EngineError::schema(
                            Some(action_id),
                            format!("unknown sql connection '{}'", name),
                        )
                    })?;
                    sql.connection = Some(conn.connection.clone());
                }
            }
            ResolvedRun::Sql(sql)
        }
        RunKind::Python(c) => {
            let mut python: PythonConfig =
                render(c, evaluator, scope, text_only).map_err(wrap)?;
            for (k, v) in &agent.env {
                python.env.entry(k.clone()).or_insert_with(|| v.clone());
            }
            ResolvedRun::Python(python)
        }
        RunKind::Exec(c) => {
            let mut exec: ExecConfig = render(c, evaluator, scope, text_only).map_err(wrap)?;
            for (k, v) in &agent.env {
                exec.env.entry(k.clone()).or_insert_with(|| v.clone());
            }
            ResolvedRun::Exec(exec)
        }
        RunKind::Chat(c) => {
            let mut chat: ChatConfig = render(c, evaluator, scope, text_only).map_err(wrap)?;
            if chat.base_url.is_none() {
                chat.base_url = agent.ollama_url.clone();
            }
            ResolvedRun::Chat(chat)
        }
        RunKind::ApiResponse(c) => ResolvedRun::ApiResponse(
            render(c, evaluator, scope, api_response_typed).map_err(wrap)?,
        ),
    };
    Ok(resolved)
}

fn render<T>(
    config: &T,
    evaluator: &Evaluator,
    scope: &Scope<'_>,
    typed: TypedPath,
) -> Result<T, ExpressionError>
where
    T: Serialize + DeserializeOwned,
{
    let raw = serde_json::to_value(config)
        .map_err(|e| ExpressionError::TypeMismatch(e.to_string()))?;
    let mut path = Vec::new();
    let rendered = render_fields(&raw, &mut path, evaluator, scope, typed)?;
    serde_json::from_value(rendered).map_err(|e| {
        ExpressionError::TypeMismatch(format!("resolved configuration is invalid: {}", e))
    })
}

fn render_fields(
    value: &Value,
    path: &mut Vec<String>,
    evaluator: &Evaluator,
    scope: &Scope<'_>,
    typed: TypedPath,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => {
            let out = evaluator.render(s, scope)?;
            if typed(path) || out.is_string() {
                Ok(out)
            } else {
                Ok(Value::String(to_text(&out)))
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                let rendered = render_fields(item, path, evaluator, scope, typed);
                path.pop();
                out.push(rendered?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                path.push(k.clone());
                let rendered = render_fields(v, path, evaluator, scope, typed);
                path.pop();
                out.insert(k.clone(), rendered?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{RunConfig, SqlConnection};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    fn outputs() -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        outputs.insert("b".to_string(), json!({"id": 7, "tags": ["x", "y"]}));
        outputs
    }

    #[test]
    fn test_http_strings_render_as_text() {
        let outputs = outputs();
        let scope = Scope::new(&outputs);
        let mut headers = BTreeMap::new();
        headers.insert("X-Id".to_string(), "{{ b.output.id }}".to_string());
        let run = RunConfig::http(HttpClientConfig {
            method: "POST".into(),
            url: "http://api/{{ b.output.id }}".into(),
            headers,
            data: Some(json!({"tags": "{{ b.output.tags }}"})),
            ..Default::default()
        });
        let resolved = resolve_run(
            run.primary().unwrap(),
            "a",
            &Workflow::default(),
            &Evaluator::new(),
            &scope,
        )
        .unwrap();
        match resolved {
            ResolvedRun::Http(http) => {
                assert_eq!(http.url, "http://api/7");
                assert_eq!(http.headers["X-Id"], "7");
                assert_eq!(http.data, Some(json!({"tags": ["x", "y"]})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sql_connection_and_typed_params() {
        let outputs = outputs();
        let scope = Scope::new(&outputs);
        let mut workflow = Workflow::default();
        workflow.settings.sql_connections.insert(
            "main".into(),
            SqlConnection {
                connection: ":memory:".into(),
            },
        );
        let run = RunConfig::sql(SqlConfig {
            connection_name: Some("main".into()),
            query: Some("SELECT ?1".into()),
            params: vec![json!("{{ b.output.id }}")],
            ..Default::default()
        });
        let resolved = resolve_run(
            run.primary().unwrap(),
            "q",
            &workflow,
            &Evaluator::new(),
            &scope,
        )
        .unwrap();
        match resolved {
            ResolvedRun::Sql(sql) => {
                assert_eq!(sql.connection.as_deref(), Some(":memory:"));
                assert_eq!(sql.params, vec![json!(7)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_agent_env_merged_under_resource_env() {
        let outputs = HashMap::new();
        let scope = Scope::new(&outputs);
        let mut workflow = Workflow::default();
        workflow
            .settings
            .agent_settings
            .env
            .insert("A".into(), "agent".into());
        workflow
            .settings
            .agent_settings
            .env
            .insert("B".into(), "agent".into());
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "resource".to_string());
        let run = RunConfig::exec(ExecConfig {
            command: "env".into(),
            env,
            ..Default::default()
        });
        match resolve_run(run.primary().unwrap(), "e", &workflow, &Evaluator::new(), &scope)
            .unwrap()
        {
            ResolvedRun::Exec(exec) => {
                assert_eq!(exec.env["A"], "agent");
                assert_eq!(exec.env["B"], "resource");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_reference_is_attributed() {
        let outputs = HashMap::new();
        let scope = Scope::new(&outputs);
        let run = RunConfig::exec(ExecConfig {
            command: "echo {{ ghost.output }}".into(),
            ..Default::default()
        });
        let err = resolve_run(
            run.primary().unwrap(),
            "e",
            &Workflow::default(),
            &Evaluator::new(),
            &scope,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownActionReference);
        assert_eq!(err.action_id(), Some("e"));
    }

    #[test]
    fn test_api_response_keeps_types() {
        let outputs = outputs();
        let scope = Scope::new(&outputs);
        let mut run = RunConfig::api_response(json!({"id": "{{ b.output.id }}"}));
        run.api_response.as_mut().unwrap().meta = Some(crate::workflow::ResponseMeta {
            headers: BTreeMap::new(),
            status_code: Some(201),
        });
        match resolve_run(
            run.primary().unwrap(),
            "r",
            &Workflow::default(),
            &Evaluator::new(),
            &scope,
        )
        .unwrap()
        {
            ResolvedRun::ApiResponse(api) => {
                assert_eq!(api.response, json!({"id": 7}));
                assert_eq!(api.meta.unwrap().status_code, Some(201));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_api_response_headers_render_as_text() {
        let outputs = outputs();
        let scope = Scope::new(&outputs);
        let mut run = RunConfig::api_response(json!("{{ b.output.id }}"));
        run.api_response.as_mut().unwrap().meta = Some(crate::workflow::ResponseMeta {
            headers: BTreeMap::from([("X-Id".to_string(), "{{ b.output.id }}".to_string())]),
            status_code: None,
        });
        match resolve_run(
            run.primary().unwrap(),
            "r",
            &Workflow::default(),
            &Evaluator::new(),
            &scope,
        )
        .unwrap()
        {
            ResolvedRun::ApiResponse(api) => {
                assert_eq!(api.response, json!(7));
                assert_eq!(api.meta.unwrap().headers.get("X-Id"), Some(&"7".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
