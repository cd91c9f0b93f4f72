// SPDX-License-Identifier: MIT

use super::{process, Executor};
use crate::engine::ExecutionState;
use crate::error::BackendError;
use crate::workflow::ExecConfig;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

/// Runs shell commands. Without `args` the command goes through `sh -c`;
/// with `args` it is spawned directly.
#[derive(Debug, Clone, Default)]
pub struct ExecExecutor;

impl ExecExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(config: &ExecConfig) -> Command {
        let mut command = if config.args.is_empty() {
            let mut sh = Command::new("sh");
            sh.arg("-c").arg(&config.command);
            sh
        } else {
            let mut direct = Command::new(&config.command);
            direct.args(&config.args);
            direct
        };
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        command.envs(&config.env);
        command
    }
}

#[async_trait]
impl Executor<ExecConfig> for ExecExecutor {
    async fn execute(
        &self,
        config: &ExecConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        if config.command.trim().is_empty() {
            return Err(BackendError::invalid_config("exec.command cannot be empty"));
        }
        let timeout = process::timeout_from(config.timeout_duration.as_deref())?;
        log::debug!("exec: {} {}", config.command, config.args.join(" "));

        let mut output = process::run(Self::command(config), timeout).await?;
        if let Value::Object(map) = &mut output {
            map.insert("command".into(), Value::String(config.command.clone()));
        }
        Ok(output)
    }
}
