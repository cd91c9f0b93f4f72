use crate::error::BackendError;
use crate::workflow::parse_duration;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Resolve an optional `timeoutDuration` field
pub(crate) fn timeout_from(raw: Option<&str>) -> Result<Option<Duration>, BackendError> {
    match raw {
        None => Ok(None),
        Some(text) => parse_duration(text)
            .map(Some)
            .ok_or_else(|| BackendError::invalid_config(format!("invalid timeout '{}'", text))),
    }
}

/// Run a prepared command to completion and capture its output.
///
/// The child is killed if the returned future is dropped.
pub(crate) async fn run(
    mut command: Command,
    timeout: Option<Duration>,
) -> Result<Value, BackendError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child)
            .await
            .map_err(|_| BackendError::Timeout(limit))??,
        None => child.await?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let code = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        return Err(BackendError::ProcessFailed {
            code,
            stderr: stderr.trim_end().to_string(),
        });
    }

    Ok(json!({
        "stdout": stdout,
        "stderr": stderr,
        "exitCode": code,
    }))
}
