// SPDX-License-Identifier: MIT

//! Execution engine
//!
//! One [`Engine`] is shared by every invocation. Each call to
//! [`Engine::execute`] owns its own [`ExecutionState`] and only reads the
//! workflow, so concurrent invocations never interfere.

mod request;
mod resolve;
mod state;

pub use request::{route_matches, RequestContext, UploadedFile};
pub use resolve::{resolve_run, ResolvedRun};
pub use state::ExecutionState;

use crate::error::{BackendError, EngineError, ExpressionError};
use crate::executor::{Executor, ExecutorRegistry};
use crate::expression::{is_truthy, to_text, Evaluator, FunctionRegistry, Scope};
use crate::graph::resolve_order;
use crate::session::{SessionData, SessionStore};
use crate::workflow::{Resource, ResponseMeta, RunKind, Workflow};
use log::Level;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    /// The target action id
    pub action_id: String,
    /// The target's output
    pub value: Value,
    /// `false` only when an `apiResponse` target says so
    pub success: bool,
    pub meta: ResponseMeta,
    /// Action ids in execution order
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub session_id: String,
}

enum Step {
    Ran,
    Skipped(&'static str),
}

#[derive(Clone)]
pub struct Engine {
    registry: ExecutorRegistry,
    evaluator: Evaluator,
    sessions: Option<Arc<dyn SessionStore>>,
    debug: bool,
}

impl Engine {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self {
            registry,
            evaluator: Evaluator::new(),
            sessions: None,
            debug: false,
        }
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.evaluator = Evaluator::with_functions(functions);
        self
    }

    /// Log evaluation and dispatch decisions at info level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ExecutorRegistry {
        &mut self.registry
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn session_store(&self) -> Option<&Arc<dyn SessionStore>> {
        self.sessions.as_ref()
    }

    fn trace_level(&self) -> Level {
        if self.debug {
            Level::Info
        } else {
            Level::Debug
        }
    }

    /// Run the workflow's target. An empty session id on `request` is
    /// filled in before this returns, whatever the outcome.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        request: Option<&mut RequestContext>,
    ) -> Result<ExecutionOutput, EngineError> {
        self.execute_with_cancel(workflow, request, CancellationToken::new())
            .await
    }

    /// Like [`Engine::execute`], abandoning in-flight work (and killing
    /// child processes) once `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        workflow: &Workflow,
        request: Option<&mut RequestContext>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, EngineError> {
        let (session_id, request) = match request {
            Some(req) => {
                if req.ensure_session_id() {
                    log::debug!("Minted session {}", req.session_id);
                }
                (req.session_id.clone(), Some(&*req))
            }
            None => (uuid::Uuid::new_v4().to_string(), None),
        };

        let current = Mutex::new(None);
        let run = self.run(workflow, request, &session_id, &current);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let action_id = current.lock().unwrap_or_else(|p| p.into_inner()).clone();
                log::warn!("Execution cancelled (resource {:?})", action_id);
                Err(EngineError::Cancelled { action_id })
            }
            result = run => result,
        }
    }

    async fn run(
        &self,
        workflow: &Workflow,
        request: Option<&RequestContext>,
        session_id: &str,
        current: &Mutex<Option<String>>,
    ) -> Result<ExecutionOutput, EngineError> {
        let target = workflow.target();
        let order = resolve_order(workflow)?;
        log::log!(
            self.trace_level(),
            "Execution order for '{}': {}",
            target,
            order.join(" -> ")
        );

        let session = self.load_session(session_id).await;
        let writes = Mutex::new(Map::new());
        let request_value = request.map(RequestContext::to_value);
        let mut state = ExecutionState::new();
        let mut target_response = None;

        for id in &order {
            let resource = workflow
                .resource(id)
                .ok_or_else(|| EngineError::schema(Some(id), "resource not found"))?;
            *current.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.clone());

            let step = self
                .step(
                    workflow,
                    resource,
                    request,
                    request_value.as_ref(),
                    &session,
                    &writes,
                    &mut state,
                    &mut target_response,
                )
                .await?;
            if let Step::Skipped(reason) = step {
                log::log!(self.trace_level(), "Skipped '{}': {}", id, reason);
                state.mark_skipped(id);
            }
        }

        let value = state
            .output(target)
            .cloned()
            .ok_or_else(|| EngineError::TargetNotExecuted {
                action_id: target.to_string(),
            })?;

        let writes = writes.into_inner().unwrap_or_else(|p| p.into_inner());
        if !writes.is_empty() {
            self.save_session(session_id, writes).await;
        }

        let (success, meta) = target_response.unwrap_or((true, ResponseMeta::default()));
        log::info!(
            "Workflow '{}' completed: {} executed, {} skipped",
            workflow.metadata.name,
            state.executed().len(),
            state.skipped().len()
        );
        Ok(ExecutionOutput {
            action_id: target.to_string(),
            value,
            success,
            meta,
            executed: state.executed().to_vec(),
            skipped: state.skipped().to_vec(),
            session_id: session_id.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn step(
        &self,
        workflow: &Workflow,
        resource: &Resource,
        request: Option<&RequestContext>,
        request_value: Option<&Value>,
        session: &SessionData,
        writes: &Mutex<SessionData>,
        state: &mut ExecutionState,
        target_response: &mut Option<(bool, ResponseMeta)>,
    ) -> Result<Step, EngineError> {
        let id = resource.action_id();
        let run = &resource.run;
        let err = |e: ExpressionError| EngineError::from_expression(id, e);

        if !restrictions_allow(resource, request) {
            return Ok(Step::Skipped("request does not match restrictToHttpMethods/Routes"));
        }

        let kind = run.primary().map_err(|m| EngineError::schema(Some(id), m))?;
        let resolved = {
            let scope = Scope::new(state.outputs())
                .with_request(request_value)
                .with_session(session)
                .with_pending_writes(writes);

            for condition in &run.skip_condition {
                let value = self.evaluator.evaluate(condition, &scope).map_err(err)?;
                log::log!(self.trace_level(), "'{}' skipCondition {} => {}", id, condition, value);
                if is_truthy(&value) {
                    return Ok(Step::Skipped("skipCondition is true"));
                }
            }

            if let Some(check) = &run.preflight_check {
                for validation in &check.validations {
                    let value = self.evaluator.evaluate(validation, &scope).map_err(err)?;
                    if !is_truthy(&value) {
                        let (code, template) = match &check.error {
                            Some(e) => (e.code, e.message.as_str()),
                            None => (400, ""),
                        };
                        let message = if template.is_empty() {
                            format!("validation failed: {}", validation)
                        } else {
                            to_text(&self.evaluator.render(template, &scope).map_err(err)?)
                        };
                        return Err(EngineError::PreflightFailed {
                            action_id: id.to_string(),
                            code,
                            message,
                        });
                    }
                }
            }

            if !self.registry.has(kind.name()) {
                return Err(EngineError::ExecutorNotAvailable {
                    kind: kind.name().to_string(),
                    action_id: id.to_string(),
                });
            }
            resolve_run(kind, id, workflow, &self.evaluator, &scope)?
        };

        log::log!(self.trace_level(), "Dispatching '{}' to {}", id, kind.name());
        let output = match resolved {
            ResolvedRun::ApiResponse(api) => {
                if id == workflow.target() {
                    *target_response = Some((api.success, api.meta.unwrap_or_default()));
                }
                api.response
            }
            ResolvedRun::Http(c) => self.dispatch(kind, id, self.registry.http(), &c, state).await?,
            ResolvedRun::Sql(c) => self.dispatch(kind, id, self.registry.sql(), &c, state).await?,
            ResolvedRun::Python(c) => {
                self.dispatch(kind, id, self.registry.python(), &c, state).await?
            }
            ResolvedRun::Exec(c) => self.dispatch(kind, id, self.registry.exec(), &c, state).await?,
            ResolvedRun::Chat(c) => self.dispatch(kind, id, self.registry.chat(), &c, state).await?,
        };
        log::info!("Resource '{}' completed", id);
        state.record(id, output);

        if !run.expr.is_empty() {
            let scope = Scope::new(state.outputs())
                .with_request(request_value)
                .with_session(session)
                .with_writes(writes);
            for expr in &run.expr {
                let value = self.evaluator.evaluate(expr, &scope).map_err(err)?;
                log::log!(self.trace_level(), "'{}' expr {} => {}", id, expr, value);
            }
        }
        Ok(Step::Ran)
    }

    async fn dispatch<C>(
        &self,
        kind: RunKind<'_>,
        action_id: &str,
        backend: Option<&Arc<dyn Executor<C>>>,
        config: &C,
        state: &ExecutionState,
    ) -> Result<Value, EngineError>
    where
        C: Send + Sync + 'static,
    {
        let backend = backend.ok_or_else(|| EngineError::ExecutorNotAvailable {
            kind: kind.name().to_string(),
            action_id: action_id.to_string(),
        })?;
        backend
            .execute(config, state)
            .await
            .map_err(|source: BackendError| {
                log::error!("Resource '{}' failed: {}", action_id, source);
                EngineError::ExecutorExecution {
                    kind: kind.name().to_string(),
                    action_id: action_id.to_string(),
                    source,
                }
            })
    }

    async fn load_session(&self, session_id: &str) -> SessionData {
        let Some(store) = &self.sessions else {
            return SessionData::new();
        };
        match store.get(session_id).await {
            Ok(data) => data.unwrap_or_default(),
            Err(e) => {
                log::warn!("Failed to load session {}: {}", session_id, e);
                SessionData::new()
            }
        }
    }

    async fn save_session(&self, session_id: &str, writes: SessionData) {
        let Some(store) = &self.sessions else {
            log::debug!("No session store attached; dropping session writes");
            return;
        };
        if let Err(e) = store.merge(session_id, writes).await {
            log::error!("Failed to save session {}: {}", session_id, e);
        }
    }
}

/// Method and route guards. Restricted resources never run without a
/// request context.
fn restrictions_allow(resource: &Resource, request: Option<&RequestContext>) -> bool {
    let run = &resource.run;
    if run.restrict_to_http_methods.is_empty() && run.restrict_to_routes.is_empty() {
        return true;
    }
    let Some(request) = request else {
        return false;
    };
    let method_ok = run.restrict_to_http_methods.is_empty()
        || run
            .restrict_to_http_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&request.method));
    let route_ok = run.restrict_to_routes.is_empty()
        || run
            .restrict_to_routes
            .iter()
            .any(|r| route_matches(r, &request.path));
    method_ok && route_ok
}
