use common::ActionExecutionError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Runs external commands with a hard timeout; the child is killed if the
/// timeout elapses.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self, args), fields(command = %command))]
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<(), ActionExecutionError> {
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActionExecutionError::ScriptSpawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ActionExecutionError::ScriptTimeout {
                command: command.to_string(),
                timeout,
            })?
            .map_err(|e| ActionExecutionError::ScriptSpawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ActionExecutionError::ScriptFailed {
                command: command.to_string(),
                status: output.status.to_string(),
            });
        }

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "script completed"
        );
        Ok(())
    }
}
