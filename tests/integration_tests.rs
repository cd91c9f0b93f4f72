//! Integration tests for workflow loading and execution
//!
//! These tests drive the public API end to end using mock executors.

use agentrun::engine::{Engine, ExecutionState, RequestContext};
use agentrun::error::{BackendError, ErrorKind};
use agentrun::executor::{Executor, ExecutorRegistry};
use agentrun::expression::{Evaluator, Scope};
use agentrun::graph::{resolve_order, DependencyGraph};
use agentrun::server::{router, AppState, SESSION_HEADER};
use agentrun::session::{InMemorySessionStore, SessionStore};
use agentrun::workflow::{ExecConfig, HttpClientConfig, Validator, Workflow, WorkflowLoader};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

// ============================================================================
// Mock Components
// ============================================================================

/// Mock HTTP backend that records every request it is asked to send
#[derive(Default)]
struct MockHttp {
    calls: Mutex<Vec<HttpClientConfig>>,
}

impl MockHttp {
    fn urls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.url.clone())
            .collect()
    }
}

#[async_trait]
impl Executor<HttpClientConfig> for MockHttp {
    async fn execute(
        &self,
        config: &HttpClientConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        self.calls.lock().unwrap().push(config.clone());
        Ok(json!({
            "statusCode": 200,
            "headers": {},
            "body": {"url": config.url, "items": [{"name": "first"}, {"name": "second"}]}
        }))
    }
}

/// Mock exec backend that echoes the command it was given
#[derive(Default)]
struct MockExec {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor<ExecConfig> for MockExec {
    async fn execute(
        &self,
        config: &ExecConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        self.calls.lock().unwrap().push(config.command.clone());
        Ok(json!({"stdout": config.command, "stderr": "", "exitCode": 0}))
    }
}

/// HTTP backend that answers after a short pause, so parallel invocations
/// are all in flight at once
struct DelayedHttp(std::time::Duration);

#[async_trait]
impl Executor<HttpClientConfig> for DelayedHttp {
    async fn execute(
        &self,
        config: &HttpClientConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        tokio::time::sleep(self.0).await;
        Ok(json!({"statusCode": 200, "headers": {}, "body": {"url": config.url}}))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

static SCENARIO_A: Lazy<String> = Lazy::new(|| {
    r#"
apiVersion: agentrun/v1
kind: Workflow
metadata:
  name: scenario-a
  targetActionId: a
resources:
  - metadata:
      actionId: a
    run:
      apiResponse:
        response: hello
"#
    .to_string()
});

static SCENARIO_B: Lazy<String> = Lazy::new(|| {
    r#"
apiVersion: agentrun/v1
kind: Workflow
metadata:
  name: scenario-b
  targetActionId: a
resources:
  - metadata:
      actionId: a
    run:
      httpClient:
        method: GET
        url: "{{ b.output }}"
  - metadata:
      actionId: b
    run:
      apiResponse:
        response: "http://x"
"#
    .to_string()
});

static SCENARIO_C: Lazy<String> = Lazy::new(|| {
    r#"
apiVersion: agentrun/v1
kind: Workflow
metadata:
  name: scenario-c
  targetActionId: a
resources:
  - metadata:
      actionId: a
    run:
      exec:
        command: "echo {{ a.output }}"
"#
    .to_string()
});

/// A small pipeline: fetch, then summarise with exec, then answer
static PIPELINE: Lazy<String> = Lazy::new(|| {
    r#"
apiVersion: agentrun/v1
kind: Workflow
metadata:
  name: pipeline
  targetActionId: answer
settings:
  apiServerMode: true
  apiServer:
    routes:
      - path: /api/v1/items
        methods: [GET, POST]
resources:
  - metadata:
      actionId: answer
    run:
      apiResponse:
        response:
          first: "{{ fetch.output.body.items[0].name }}"
          count: "{{ len(fetch.output.body.items) }}"
          shout: "{{ report.output.stdout }}"
  - metadata:
      actionId: report
    run:
      exec:
        command: "echo {{ upper(fetch.output.body.items[1].name) }}"
  - metadata:
      actionId: fetch
    run:
      httpClient:
        url: "http://api.local/items?q={{ default(get('q'), 'all') }}"
"#
    .to_string()
});

/// Each invocation fetches by `q`, records `q` in the session, and fails
/// its preflight when `q` is `bad`
static PER_QUERY: Lazy<String> = Lazy::new(|| {
    r#"
apiVersion: agentrun/v1
kind: Workflow
metadata:
  name: per-query
  targetActionId: answer
resources:
  - metadata:
      actionId: answer
    run:
      preflightCheck:
        validations:
          - "get('q') != 'bad'"
        error:
          code: 422
          message: "rejected {{ get('q') }}"
      expr:
        - "set(get('q'), fetch.output.body.url)"
      apiResponse:
        response: "{{ fetch.output.body.url }}"
  - metadata:
      actionId: fetch
    run:
      httpClient:
        url: "http://api.local/{{ get('q') }}"
"#
    .to_string()
});

fn parse(yaml: &str) -> Workflow {
    WorkflowLoader::parse_yaml(yaml).unwrap()
}

fn mocked_engine() -> (Engine, Arc<MockHttp>, Arc<MockExec>) {
    let http = Arc::new(MockHttp::default());
    let exec = Arc::new(MockExec::default());
    let mut registry = ExecutorRegistry::new();
    registry.set_http_executor(http.clone());
    registry.set_exec_executor(exec.clone());
    let engine = Engine::new(registry).with_session_store(Arc::new(InMemorySessionStore::default()));
    (engine, http, exec)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_api_response_without_backends() {
    let workflow = parse(&SCENARIO_A);
    Validator::new().validate(&workflow).unwrap();

    let (engine, http, exec) = mocked_engine();
    let output = engine.execute(&workflow, None).await.unwrap();

    assert_eq!(output.value, json!("hello"));
    assert_eq!(output.executed, vec!["a".to_string()]);
    assert!(http.urls().is_empty());
    assert!(exec.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_b_missing_http_backend() {
    let workflow = parse(&SCENARIO_B);
    Validator::new().validate(&workflow).unwrap();
    assert_eq!(resolve_order(&workflow).unwrap(), vec!["b", "a"]);

    let err = Engine::new(ExecutorRegistry::new())
        .execute(&workflow, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutorNotAvailable);
    assert_eq!(err.action_id(), Some("a"));
    assert!(err.to_string().contains("'http'"));
}

#[tokio::test]
async fn test_scenario_b_with_http_backend() {
    let workflow = parse(&SCENARIO_B);
    let (engine, http, _) = mocked_engine();

    let output = engine.execute(&workflow, None).await.unwrap();
    assert_eq!(output.executed, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(http.urls(), vec!["http://x".to_string()]);
    assert_eq!(output.value["statusCode"], json!(200));
}

#[tokio::test]
async fn test_scenario_c_self_reference_rejected() {
    let workflow = parse(&SCENARIO_C);
    let err = Validator::new().validate(&workflow).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyCycle);
    assert_eq!(err.action_id(), Some("a"));

    // the engine refuses too, before any backend runs
    let (engine, _, exec) = mocked_engine();
    let err = engine.execute(&workflow, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyCycle);
    assert!(exec.calls.lock().unwrap().is_empty());
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_order_places_dependencies_first() {
    let workflow = parse(&PIPELINE);
    let graph = DependencyGraph::build(&workflow).unwrap();
    let order = resolve_order(&workflow).unwrap();
    assert_eq!(order, vec!["fetch", "report", "answer"]);

    for (i, id) in order.iter().enumerate() {
        for dep in graph.dependencies(id) {
            let pos = order.iter().position(|o| o == dep).unwrap();
            assert!(pos < i, "{} must run before {}", dep, id);
        }
    }
}

#[test]
fn test_text_without_templates_is_unchanged() {
    let outputs = HashMap::new();
    let scope = Scope::new(&outputs);
    let evaluator = Evaluator::new();
    for text in ["plain", "", "a { b } c", "price: $5"] {
        assert_eq!(evaluator.render(text, &scope).unwrap(), json!(text));
    }
}

#[tokio::test]
async fn test_pipeline_output() {
    let workflow = parse(&PIPELINE);
    Validator::new().validate(&workflow).unwrap();
    let (engine, http, exec) = mocked_engine();

    let mut request = RequestContext::new("GET", "/api/v1/items").with_query("q", "books");
    let output = engine.execute(&workflow, Some(&mut request)).await.unwrap();

    assert_eq!(
        output.value,
        json!({"first": "first", "count": 2, "shout": "echo SECOND"})
    );
    assert_eq!(http.urls(), vec!["http://api.local/items?q=books".to_string()]);
    assert_eq!(*exec.calls.lock().unwrap(), vec!["echo SECOND".to_string()]);
}

#[tokio::test]
async fn test_identical_inputs_identical_outputs() {
    let workflow = parse(&PIPELINE);
    let (engine, _, _) = mocked_engine();

    let mut first_req = RequestContext::new("GET", "/api/v1/items").with_session_id("fixed");
    let mut second_req = RequestContext::new("GET", "/api/v1/items").with_session_id("fixed");
    let first = engine.execute(&workflow, Some(&mut first_req)).await.unwrap();
    let second = engine.execute(&workflow, Some(&mut second_req)).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_session_id_minted_and_preserved() {
    let workflow = parse(&SCENARIO_A);
    let (engine, _, _) = mocked_engine();

    let mut fresh = RequestContext::new("GET", "/");
    assert!(fresh.session_id.is_empty());
    let output = engine.execute(&workflow, Some(&mut fresh)).await.unwrap();
    assert!(!fresh.session_id.is_empty());
    assert_eq!(output.session_id, fresh.session_id);

    let mut preset = RequestContext::new("GET", "/").with_session_id("keep-me");
    engine.execute(&workflow, Some(&mut preset)).await.unwrap();
    assert_eq!(preset.session_id, "keep-me");

    // minted even when the invocation fails
    let mut failing = RequestContext::new("GET", "/");
    Engine::new(ExecutorRegistry::new())
        .execute(&parse(&SCENARIO_B), Some(&mut failing))
        .await
        .unwrap_err();
    assert!(!failing.session_id.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_invocations_are_independent() {
    let workflow = Arc::new(parse(&PER_QUERY));
    Validator::new().validate(&workflow).unwrap();

    let store = Arc::new(InMemorySessionStore::default());
    let mut registry = ExecutorRegistry::new();
    registry.set_http_executor(Arc::new(DelayedHttp(std::time::Duration::from_millis(30))));
    let engine = Engine::new(registry).with_session_store(store.clone());

    let queries = ["alpha", "bad", "beta", "gamma", "bad", "delta"];
    let tasks: Vec<_> = queries
        .iter()
        .map(|q| {
            let engine = engine.clone();
            let workflow = workflow.clone();
            let q = q.to_string();
            tokio::spawn(async move {
                let mut request = RequestContext::new("GET", "/")
                    .with_query("q", &q)
                    .with_session_id("shared");
                (q, engine.execute(&workflow, Some(&mut request)).await)
            })
        })
        .collect();

    for task in tasks {
        let (q, result) = task.await.unwrap();
        if q == "bad" {
            let err = result.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PreflightFailed);
            assert_eq!(err.action_id(), Some("answer"));
        } else {
            let output = result.unwrap();
            assert_eq!(output.value, json!(format!("http://api.local/{}", q)));
            assert_eq!(output.executed, vec!["fetch".to_string(), "answer".to_string()]);
        }
    }

    // every successful invocation's write survives, failed ones write nothing
    let session = store.get("shared").await.unwrap().unwrap();
    for q in ["alpha", "beta", "gamma", "delta"] {
        assert_eq!(session.get(q), Some(&json!(format!("http://api.local/{}", q))));
    }
    assert!(session.get("bad").is_none());
    assert_eq!(session.len(), 4);
}

#[tokio::test]
async fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workflow.yaml");
    std::fs::write(&path, PIPELINE.as_str()).unwrap();

    let workflow = WorkflowLoader::new().load_workflow(&path).unwrap();
    assert_eq!(workflow.metadata.name, "pipeline");
    assert_eq!(workflow.resources.len(), 3);
    Validator::new().validate(&workflow).unwrap();
}

// ============================================================================
// HTTP server
// ============================================================================

#[tokio::test]
async fn test_server_runs_pipeline() {
    let (engine, http, _) = mocked_engine();
    let state = Arc::new(AppState::new(parse(&PIPELINE), engine));
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/items?q=films")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(SESSION_HEADER));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["count"], json!(2));
    assert_eq!(body["meta"]["actionId"], json!("answer"));
    assert_eq!(http.urls(), vec!["http://api.local/items?q=films".to_string()]);

    let rejected = app
        .oneshot(Request::delete("/api/v1/items").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_server_reports_engine_errors() {
    let workflow = parse(&SCENARIO_B);
    let state = Arc::new(AppState::new(workflow, Engine::new(ExecutorRegistry::new())));

    let response = router(state)
        .oneshot(Request::get("/anything").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"]["kind"], json!("executorNotAvailable"));
    assert_eq!(body["error"]["actionId"], json!("a"));
}
