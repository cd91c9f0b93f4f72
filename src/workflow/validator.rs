// SPDX-License-Identifier: MIT

//! Workflow validation
//!
//! Runs before a workflow is accepted, both at load time and on every hot
//! reload. Checks run in a fixed order and the first failure is returned:
//! schema, target, unique ids, acyclic graph, then expression references.

use super::types::{RunKind, Workflow};
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::workflow::parse_duration;
use std::collections::HashSet;

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Default, Clone, Copy)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, workflow: &Workflow) -> Result<(), EngineError> {
        self.validate_schema(workflow)?;
        self.validate_target(workflow)?;
        self.validate_unique_ids(workflow)?;

        let graph = DependencyGraph::build(workflow)?;
        if let Some(cycle) = graph.find_cycle() {
            return Err(EngineError::DependencyCycle { cycle });
        }
        if let Some((action_id, reference)) = graph.unknown_references().first() {
            return Err(EngineError::UnknownActionReference {
                action_id: action_id.clone(),
                reference: reference.clone(),
            });
        }

        log::debug!(
            "Workflow '{}' validated ({} resources)",
            workflow.metadata.name,
            workflow.resources.len()
        );
        Ok(())
    }

    fn validate_schema(&self, workflow: &Workflow) -> Result<(), EngineError> {
        if workflow.metadata.name.trim().is_empty() {
            return Err(EngineError::schema(None, "metadata.name is required"));
        }
        if workflow.metadata.target_action_id.trim().is_empty() {
            return Err(EngineError::schema(
                None,
                "metadata.targetActionId is required",
            ));
        }

        let settings = &workflow.settings;
        if settings.api_server_mode {
            let api = settings.api_server.as_ref().ok_or_else(|| {
                EngineError::schema(None, "apiServerMode is set but apiServer is missing")
            })?;
            if api.port_num == 0 || api.port_num > 65535 {
                return Err(EngineError::schema(
                    None,
                    format!("apiServer.portNum {} is out of range 1-65535", api.port_num),
                ));
            }
            if api.routes.is_empty() {
                return Err(EngineError::schema(
                    None,
                    "apiServer.routes needs at least one route",
                ));
            }
            for route in &api.routes {
                if !route.path.starts_with('/') {
                    return Err(EngineError::schema(
                        None,
                        format!("route path '{}' must start with '/'", route.path),
                    ));
                }
                check_methods(None, &route.methods)?;
            }
        }
        if settings.web_server_mode {
            for route in settings
                .web_server
                .as_ref()
                .map(|w| w.routes.as_slice())
                .unwrap_or_default()
            {
                if !route.path.starts_with('/') {
                    return Err(EngineError::schema(
                        None,
                        format!("web route path '{}' must start with '/'", route.path),
                    ));
                }
            }
        }

        if workflow.resources.is_empty() {
            return Err(EngineError::schema(None, "workflow declares no resources"));
        }

        for resource in &workflow.resources {
            let id = resource.action_id();
            if id.trim().is_empty() {
                return Err(EngineError::schema(
                    None,
                    "every resource needs metadata.actionId",
                ));
            }
            if crate::expression::is_reserved_root(id) {
                return Err(EngineError::schema(
                    Some(id),
                    format!("actionId '{}' is reserved for the {} scope", id, id),
                ));
            }
            let at = Some(id);
            let run = &resource.run;
            check_methods(at, &run.restrict_to_http_methods)?;
            for route in &run.restrict_to_routes {
                if !route.starts_with('/') {
                    return Err(EngineError::schema(
                        at,
                        format!("restrictToRoutes entry '{}' must start with '/'", route),
                    ));
                }
            }

            let primary = run.primary().map_err(|m| EngineError::schema(at, m))?;
            match primary {
                RunKind::HttpClient(c) => {
                    require(at, !c.url.trim().is_empty(), "httpClient.url is required")?;
                    if !c.method.is_empty() {
                        check_methods(at, std::slice::from_ref(&c.method))?;
                    }
                    check_timeout(at, c.timeout_duration.as_deref())?;
                }
                RunKind::Sql(c) => {
                    require(
                        at,
                        c.connection.is_some() || c.connection_name.is_some(),
                        "sql needs connection or connectionName",
                    )?;
                    if let Some(name) = &c.connection_name {
                        require(
                            at,
                            name.contains("{{") || settings.sql_connections.contains_key(name),
                            &format!("sql connectionName '{}' is not declared in settings", name),
                        )?;
                    }
                    require(
                        at,
                        c.query.is_some() || !c.queries.is_empty(),
                        "sql needs query or queries",
                    )?;
                }
                RunKind::Python(c) => {
                    require(
                        at,
                        c.script.is_some() != c.script_file.is_some(),
                        "python needs exactly one of script or scriptFile",
                    )?;
                    check_timeout(at, c.timeout_duration.as_deref())?;
                }
                RunKind::Exec(c) => {
                    require(at, !c.command.trim().is_empty(), "exec.command is required")?;
                    check_timeout(at, c.timeout_duration.as_deref())?;
                }
                RunKind::Chat(c) => {
                    require(at, !c.model.trim().is_empty(), "chat.model is required")?;
                    require(at, !c.prompt.trim().is_empty(), "chat.prompt is required")?;
                    check_timeout(at, c.timeout_duration.as_deref())?;
                }
                RunKind::ApiResponse(_) => {}
            }
        }
        Ok(())
    }

    fn validate_target(&self, workflow: &Workflow) -> Result<(), EngineError> {
        if workflow.resource(workflow.target()).is_none() {
            return Err(EngineError::schema(
                None,
                format!(
                    "targetActionId '{}' does not name a resource",
                    workflow.target()
                ),
            ));
        }
        Ok(())
    }

    fn validate_unique_ids(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for resource in &workflow.resources {
            if !seen.insert(resource.action_id()) {
                return Err(EngineError::schema(
                    Some(resource.action_id()),
                    "duplicate actionId",
                ));
            }
        }
        Ok(())
    }
}

fn require(action_id: Option<&str>, ok: bool, message: &str) -> Result<(), EngineError> {
    if ok {
        Ok(())
    } else {
        Err(EngineError::schema(action_id, message))
    }
}

fn check_methods(action_id: Option<&str>, methods: &[String]) -> Result<(), EngineError> {
    for method in methods {
        if !HTTP_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
            return Err(EngineError::schema(
                action_id,
                format!("unsupported HTTP method '{}'", method),
            ));
        }
    }
    Ok(())
}

/// Literal timeouts must parse; templated ones are checked at run time
fn check_timeout(action_id: Option<&str>, timeout: Option<&str>) -> Result<(), EngineError> {
    match timeout {
        Some(t) if !t.contains("{{") && parse_duration(t).is_none() => Err(EngineError::schema(
            action_id,
            format!("invalid timeoutDuration '{}'", t),
        )),
        _ => Ok(()),
    }
}
