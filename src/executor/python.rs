// SPDX-License-Identifier: MIT

use super::{process, Executor};
use crate::engine::ExecutionState;
use crate::error::BackendError;
use crate::workflow::PythonConfig;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

/// Runs inline scripts or script files with a Python interpreter.
/// The interpreter is assumed to be provisioned already.
#[derive(Debug, Clone)]
pub struct PythonExecutor {
    bin: String,
}

impl PythonExecutor {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }
}

impl Default for PythonExecutor {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl Executor<PythonConfig> for PythonExecutor {
    async fn execute(
        &self,
        config: &PythonConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        let mut command = Command::new(&self.bin);
        match (&config.script, &config.script_file) {
            (Some(script), None) => {
                command.arg("-c").arg(script);
            }
            (None, Some(file)) => {
                command.arg(file);
            }
            _ => {
                return Err(BackendError::invalid_config(
                    "python needs exactly one of script or scriptFile",
                ))
            }
        }
        command.args(&config.args).envs(&config.env);

        let timeout = process::timeout_from(config.timeout_duration.as_deref())?;
        log::debug!("python: running with {}", self.bin);
        process::run(command, timeout).await
    }
}
