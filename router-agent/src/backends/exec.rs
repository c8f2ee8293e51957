// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external commands and mapping their failures.

use std::process::{ExitStatus, Output};
use tokio::process::Command;

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Failed to parse output of [{command}]: {reason}")]
    ParseFailure { command: String, reason: String },
}

impl ExecutionError {
    /// Stderr of a command that ran and exited unsuccessfully.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure(info) => Some(&info.stderr),
            _ => None,
        }
    }
}

pub(crate) fn command_to_string(command: &Command) -> String {
    let command = command.as_std();
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

fn output_to_exec_error(command: &Command, output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Run `command` to completion, failing if it cannot start or exits non-zero.
pub async fn execute(command: &mut Command) -> Result<Output, ExecutionError> {
    let output = command.output().await.map_err(|err| {
        ExecutionError::ExecutionStart {
            command: command_to_string(command),
            err,
        }
    })?;

    if !output.status.success() {
        return Err(output_to_exec_error(command, &output));
    }

    Ok(output)
}

/// Run `command` and return its trimmed stdout.
pub async fn execute_stdout(
    command: &mut Command,
) -> Result<String, ExecutionError> {
    let output = execute(command).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run `command` and parse its stdout as JSON.
pub async fn execute_json<T: serde::de::DeserializeOwned>(
    command: &mut Command,
) -> Result<T, ExecutionError> {
    let stdout = execute_stdout(command).await?;
    serde_json::from_str(&stdout).map_err(|err| ExecutionError::ParseFailure {
        command: command_to_string(command),
        reason: format!("{err} in {stdout:?}"),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonzero_exit_captures_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 3"]);
        let err = execute(&mut command).await.unwrap_err();
        match &err {
            ExecutionError::CommandFailure(info) => {
                assert_eq!(info.stdout, "out\n");
                assert_eq!(info.stderr, "err\n");
                assert_eq!(info.status.code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.stderr(), Some("err\n"));
        assert!(err.to_string().starts_with("Command [sh -c"));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let mut command = Command::new("/nonexistent/router-agent-test-bin");
        let err = execute(&mut command).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }));
    }

    #[tokio::test]
    async fn json_output_is_parsed() {
        let mut command = Command::new("sh");
        command.args(["-c", r#"echo '{"a": [1, 2]}'"#]);
        let value: serde_json::Value = execute_json(&mut command).await.unwrap();
        assert_eq!(value, serde_json::json!({"a": [1, 2]}));

        let mut command = Command::new("sh");
        command.args(["-c", "echo not-json"]);
        let err = execute_json::<serde_json::Value>(&mut command)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ParseFailure { .. }));
    }
}
