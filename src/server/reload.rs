//! Development-mode hot reload
//!
//! Watches the directory holding the workflow file. On any YAML change the
//! workflow is re-read and re-validated; a valid result replaces the active
//! snapshot, an invalid one is logged and ignored.

use super::AppState;
use crate::workflow::{Validator, Workflow, WorkflowLoader};
use anyhow::Context;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Quiet period before a burst of file events triggers one reload
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Load a workflow file and run the validator over it
pub fn load_checked(path: &Path) -> anyhow::Result<Workflow> {
    let workflow = WorkflowLoader::new()
        .load_workflow(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Validator::new()
        .validate(&workflow)
        .with_context(|| format!("workflow {} is invalid", path.display()))?;
    Ok(workflow)
}

/// Re-read `path` and swap it in if valid. Returns whether it was applied.
pub fn reload(state: &AppState, path: &Path) -> bool {
    match load_checked(path) {
        Ok(workflow) => {
            log::info!(
                "Reloaded workflow '{}' ({} resources)",
                workflow.metadata.name,
                workflow.resources.len()
            );
            state.swap_workflow(workflow);
            true
        }
        Err(e) => {
            log::error!("Reload rejected, keeping previous workflow: {:#}", e);
            false
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

fn relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| is_yaml(p))
}

/// Watch the workflow's directory until `shutdown` fires
pub async fn watch(
    path: PathBuf,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), notify::Error> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) if relevant(&event) => {
                for p in event.paths {
                    // receiver gone means the server is stopping
                    let _ = tx.send(p);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("File watcher error: {}", e),
        },
        Config::default(),
    )?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    watcher.watch(&dir, RecursiveMode::Recursive)?;
    log::info!("Watching {} for workflow changes", dir.display());

    loop {
        let changed = tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = rx.recv() => match changed {
                Some(p) => p,
                None => break,
            },
        };

        // collapse editor save bursts into one reload
        while let Ok(Some(_)) = tokio::time::timeout(DEBOUNCE, rx.recv()).await {}
        log::debug!("Change detected in {}", changed.display());

        let state = state.clone();
        let path = path.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || reload(&state, &path)).await {
            log::error!("Reload task failed: {}", e);
        }
    }

    log::debug!("Workflow watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::executor::ExecutorRegistry;
    use std::fs;

    const VALID: &str = r#"
apiVersion: agentrun/v1
kind: Workflow
metadata:
  name: greeter
  targetActionId: reply
resources:
  - metadata:
      actionId: reply
    run:
      apiResponse:
        response: "{{VALUE}}"
"#;

    fn write(path: &Path, value: &str) {
        fs::write(path, VALID.replace("{{VALUE}}", value)).unwrap();
    }

    fn state_for(path: &Path) -> AppState {
        AppState::new(load_checked(path).unwrap(), Engine::new(ExecutorRegistry::new()))
    }

    #[test]
    fn test_valid_change_is_swapped_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.yaml");
        write(&path, "v1");
        let state = state_for(&path);

        write(&path, "v2");
        assert!(reload(&state, &path));
        let current = state.workflow();
        assert_eq!(
            current.resources[0].run.api_response.as_ref().unwrap().response,
            serde_json::json!("v2")
        );
    }

    #[test]
    fn test_invalid_change_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.yaml");
        write(&path, "v1");
        let state = state_for(&path);

        // self-referencing resource forms a cycle
        write(&path, "{{ reply.output }}");
        assert!(!reload(&state, &path));

        fs::write(&path, "not: [valid").unwrap();
        assert!(!reload(&state, &path));

        let current = state.workflow();
        assert_eq!(
            current.resources[0].run.api_response.as_ref().unwrap().response,
            serde_json::json!("v1")
        );
    }

    #[test]
    fn test_is_yaml() {
        assert!(is_yaml(Path::new("a/workflow.yaml")));
        assert!(is_yaml(Path::new("r.yml")));
        assert!(!is_yaml(Path::new("notes.txt")));
    }
}
