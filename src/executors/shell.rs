//! Shell command executor

use crate::error::{FlowError, Result};
use crate::models::{ExecutionResult, ShellConfig};
use crate::parser::validate_shell_config;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shell executor for local command execution
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    max_output_bytes: usize,
}

impl ShellExecutor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    /// Run `config` with `extra_env` layered over its own environment.
    ///
    /// Returns `Ok` for any command that ran to completion, successful or
    /// not. Cancelling `cancel` kills the child process.
    pub async fn execute(
        &self,
        config: &ShellConfig,
        extra_env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        validate_shell_config(config)?;

        info!("Executing shell command: {}", config.command);
        debug!("Command args: {:?}", config.args);

        let start = std::time::Instant::now();

        // Individual args, no shell interpolation
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(workdir) = &config.workdir {
            cmd.current_dir(workdir);
        }

        if let Some(env) = &config.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        // Dropping the output future on cancellation must not orphan the child
        cmd.kill_on_drop(true);

        let output = tokio::select! {
            output = cmd.output() => output,
            _ = cancel.cancelled() => {
                error!("Command cancelled: {}", config.command);
                return Err(FlowError::Cancelled(config.command.clone()));
            }
        };

        let duration = start.elapsed();

        match output {
            Ok(output) => {
                let (stdout, stdout_truncated) =
                    super::truncate_output_bytes(&output.stdout, self.max_output_bytes);
                let (stderr, stderr_truncated) =
                    super::truncate_output_bytes(&output.stderr, self.max_output_bytes);
                let output_truncated = stdout_truncated || stderr_truncated;

                if output_truncated {
                    debug!("Output truncated to {} bytes", self.max_output_bytes);
                }

                info!(
                    "Command completed (success: {}, exit code: {:?})",
                    output.status.success(),
                    output.status.code()
                );

                Ok(ExecutionResult {
                    success: output.status.success(),
                    stdout,
                    stderr,
                    exit_code: output.status.code(),
                    duration,
                    output_truncated,
                })
            }
            Err(e) => {
                error!("Command execution failed: {}", e);
                Err(FlowError::Io(e))
            }
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(crate::models::MAX_OUTPUT_SIZE)
    }
}
