//! Dependency resolution between resources
//!
//! Edges come from two places: the explicit `requires` list and every
//! action id an expression mentions, found by scanning the run config
//! without evaluating anything. Execution order is limited to what the
//! target transitively needs; ties go to declaration order.

use crate::error::EngineError;
use crate::expression::{is_reserved_root, scan_guard, scan_template, Reference};
use crate::workflow::{Resource, Workflow};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Static dependency graph of a workflow
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Action ids in declaration order
    nodes: Vec<String>,
    /// Action id -> the action ids it depends on
    edges: HashMap<String, Vec<String>>,
    /// (resource, reference) pairs naming no declared resource
    unknown: Vec<(String, String)>,
}

impl DependencyGraph {
    /// Scan every resource of `workflow`
    pub fn build(workflow: &Workflow) -> Result<Self, EngineError> {
        let declared: HashSet<&str> = workflow
            .resources
            .iter()
            .map(|r| r.action_id())
            .collect();

        let mut nodes = Vec::with_capacity(workflow.resources.len());
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut unknown = Vec::new();

        for resource in &workflow.resources {
            let id = resource.action_id().to_string();
            if !edges.contains_key(&id) {
                nodes.push(id.clone());
            }
            let deps = edges.entry(id.clone()).or_default();

            for reference in scan_resource(resource)? {
                let name = reference.name();
                if matches!(reference, Reference::Root(_)) && is_reserved_root(name) {
                    continue;
                }
                if declared.contains(name) {
                    if !deps.iter().any(|d| d == name) {
                        deps.push(name.to_string());
                    }
                } else if !unknown.iter().any(|(a, r): &(String, String)| a == &id && r == name) {
                    unknown.push((id.clone(), name.to_string()));
                }
            }
        }

        Ok(Self {
            nodes,
            edges,
            unknown,
        })
    }

    pub fn dependencies(&self, action_id: &str) -> &[String] {
        self.edges
            .get(action_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn unknown_references(&self) -> &[(String, String)] {
        &self.unknown
    }

    /// First cycle found anywhere in the graph, as a closed path
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        for id in &self.nodes {
            if let Some(cycle) = self.cycle_from(id, &mut visited) {
                return Some(cycle);
            }
        }
        None
    }

    /// Depth-first search from `start`; `visited` persists across calls
    fn cycle_from<'a>(
        &'a self,
        start: &'a str,
        visited: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if visited.contains(start) {
            return None;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        // (node, index of the next dependency to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        path.push(start);
        on_path.insert(start);

        while let Some((node, next)) = stack.last_mut() {
            let deps = self.dependencies(node);
            if let Some(dep) = deps.get(*next) {
                *next += 1;
                let dep = dep.as_str();
                if on_path.contains(dep) {
                    let pos = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[pos..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                if !visited.contains(dep) {
                    stack.push((dep, 0));
                    path.push(dep);
                    on_path.insert(dep);
                }
            } else {
                let done = *node;
                visited.insert(done);
                on_path.remove(done);
                path.pop();
                stack.pop();
            }
        }
        None
    }

    /// Everything `target` transitively depends on, including itself
    pub fn reachable(&self, target: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut pending = vec![target.to_string()];
        while let Some(id) = pending.pop() {
            if seen.insert(id.clone()) {
                pending.extend(self.dependencies(&id).iter().cloned());
            }
        }
        seen
    }

    /// Ordered ids to run so that `target` executes last
    pub fn execution_order(&self, target: &str) -> Result<Vec<String>, EngineError> {
        if !self.edges.contains_key(target) {
            return Err(EngineError::schema(
                None,
                format!("targetActionId '{}' does not name a resource", target),
            ));
        }

        let mut visited = HashSet::new();
        if let Some(cycle) = self.cycle_from(target, &mut visited) {
            return Err(EngineError::DependencyCycle { cycle });
        }

        let needed = self.reachable(target);
        let mut completed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(needed.len());

        while order.len() < needed.len() {
            let ready = self.nodes.iter().find(|id| {
                needed.contains(*id)
                    && !completed.contains(id.as_str())
                    && self
                        .dependencies(id)
                        .iter()
                        .all(|d| completed.contains(d.as_str()))
            });
            match ready {
                Some(id) => {
                    completed.insert(id.as_str());
                    order.push(id.clone());
                }
                None => {
                    let stuck: Vec<String> = self
                        .nodes
                        .iter()
                        .filter(|id| needed.contains(*id) && !completed.contains(id.as_str()))
                        .cloned()
                        .collect();
                    return Err(EngineError::DependencyCycle { cycle: stuck });
                }
            }
        }

        Ok(order)
    }
}

/// Resolve the execution order for the workflow's target
pub fn resolve_order(workflow: &Workflow) -> Result<Vec<String>, EngineError> {
    DependencyGraph::build(workflow)?.execution_order(workflow.target())
}

/// Every reference a resource makes, in the order they appear
fn scan_resource(resource: &Resource) -> Result<Vec<Reference>, EngineError> {
    let id = resource.action_id();
    let syntax = |source| EngineError::ExpressionSyntax {
        action_id: Some(id.to_string()),
        source,
    };
    let run = &resource.run;

    let mut refs: Vec<Reference> = resource
        .metadata
        .requires
        .iter()
        .map(|r| Reference::Output(r.clone()))
        .collect();

    for guard in &run.skip_condition {
        refs.extend(scan_guard(guard).map_err(syntax)?);
    }
    if let Some(preflight) = &run.preflight_check {
        for check in &preflight.validations {
            refs.extend(scan_guard(check).map_err(syntax)?);
        }
        if let Some(error) = &preflight.error {
            refs.extend(scan_template(&error.message).map_err(syntax)?);
        }
    }

    let primary = run
        .primary()
        .map_err(|message| EngineError::schema(Some(id), message))?;
    let config = primary
        .to_value()
        .map_err(|e| EngineError::schema(Some(id), e.to_string()))?;
    let mut strings = Vec::new();
    collect_strings(&config, &mut strings);
    for s in strings {
        refs.extend(scan_template(s).map_err(syntax)?);
    }

    // `expr` runs after the resource's own output exists
    for block in &run.expr {
        refs.extend(
            scan_guard(block)
                .map_err(syntax)?
                .into_iter()
                .filter(|r| r.name() != id),
        );
    }

    Ok(refs)
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
