/// The external task bound to the watchdog, and the record of one execution.
///
/// The command line is split on whitespace: the first token is the program,
/// the rest are its arguments. No shell is involved.
use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::process::Command;

/// Errors raised while turning a command line into something runnable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("empty command")]
    EmptyCommand,
}

/// Split a command line into program and arguments.
pub fn split_command_line(command_line: &str) -> Result<(&str, Vec<&str>), TaskError> {
    let mut tokens = command_line.split_whitespace();
    let program = tokens.next().ok_or(TaskError::EmptyCommand)?;
    Ok((program, tokens.collect()))
}

/// Immutable description of the command to run on expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    command_line: String,
}

impl TaskSpec {
    /// Build a task from a command line. Whitespace-only input is rejected.
    pub fn new(command_line: impl Into<String>) -> Result<Self, TaskError> {
        let command_line = command_line.into();
        split_command_line(&command_line)?;
        Ok(Self { command_line })
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn program(&self) -> &str {
        self.command_line
            .split_whitespace()
            .next()
            .unwrap_or_default()
    }

    pub fn arguments(&self) -> Vec<&str> {
        self.command_line.split_whitespace().skip(1).collect()
    }

    /// Run the command once, capturing stdout.
    ///
    /// Never fails: spawn errors, non-zero exits and I/O errors are folded
    /// into the returned record's `failure`.
    pub async fn execute(&self, cycle: u64) -> OutcomeRecord {
        let program = self.program();
        if program.is_empty() {
            return OutcomeRecord::failed(cycle, String::new(), TaskError::EmptyCommand.to_string());
        }

        tracing::info!(cycle, command = %self.command_line, "timer expired, running task");

        let output = Command::new(program)
            .args(self.arguments())
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    OutcomeRecord::succeeded(cycle, stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let mut failure = match output.status.code() {
                        Some(code) => format!("exit status {code}"),
                        None => "terminated by signal".to_string(),
                    };
                    if !stderr.trim().is_empty() {
                        failure.push_str(": ");
                        failure.push_str(stderr.trim());
                    }
                    OutcomeRecord::failed(cycle, stdout, failure)
                }
            }
            Err(e) => OutcomeRecord::failed(
                cycle,
                String::new(),
                format!("failed to run {program}: {e}"),
            ),
        }
    }
}

/// Result of one fired arm cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    /// Arm cycle that produced this record.
    pub cycle: u64,
    /// Captured standard output.
    pub output: String,
    /// Launch or exit failure, if any.
    pub failure: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn succeeded(cycle: u64, output: String) -> Self {
        Self {
            cycle,
            output,
            failure: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(cycle: u64, output: String, failure: String) -> Self {
        Self {
            cycle,
            output,
            failure: Some(failure),
            finished_at: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}
