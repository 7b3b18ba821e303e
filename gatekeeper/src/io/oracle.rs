//! Inference oracle boundary.
//!
//! The [`Oracle`] trait decouples classification and decomposition from the
//! model backend. The shipped adapter pipes a prompt through a configured
//! command; tests use scripted oracles that never spawn processes.

use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::config::OracleConfig;
use crate::io::process::run_command_with_timeout;

/// What the oracle is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleTask {
    Classify,
    Decompose,
}

impl OracleTask {
    pub fn as_str(self) -> &'static str {
        match self {
            OracleTask::Classify => "classify",
            OracleTask::Decompose => "decompose",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub task: OracleTask,
    /// The request text the prompt is about.
    pub subject: String,
    pub prompt: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// A black-box model returning text for a prompt.
pub trait Oracle: Send + Sync {
    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError>;
}

/// Oracle that runs a command with the prompt on stdin and reads the reply from stdout.
pub struct CommandOracle {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandOracle {
    /// `None` when no command is configured.
    pub fn from_config(config: &OracleConfig) -> Option<Self> {
        if config.command.is_empty() {
            return None;
        }
        Some(Self {
            command: config.command.clone(),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl Oracle for CommandOracle {
    #[instrument(
        skip_all,
        fields(task = request.task.as_str(), timeout_ms = request.timeout.as_millis() as u64)
    )]
    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(OracleError::Unavailable("empty oracle command".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).env("GATEKEEPER_TASK", request.task.as_str());

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| OracleError::Unavailable(format!("{e:#}")))?;

        if output.timed_out {
            warn!("oracle command timed out");
            return Err(OracleError::Timeout(request.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            return Err(OracleError::Unavailable(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        debug!(bytes = output.stdout.len(), "oracle replied");
        Ok(output.stdout_lossy())
    }
}

/// Oracle used when none is configured. Every call degrades to the conservative default.
pub struct NoOracle;

impl Oracle for NoOracle {
    fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
        Err(OracleError::Unavailable("no oracle configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeout: Duration) -> OracleRequest {
        OracleRequest {
            task: OracleTask::Classify,
            subject: "show memory usage".to_string(),
            prompt: "prompt body".to_string(),
            timeout,
        }
    }

    fn oracle(script: &str) -> CommandOracle {
        CommandOracle::from_config(&OracleConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            ..OracleConfig::default()
        })
        .expect("configured")
    }

    #[test]
    fn empty_command_means_no_oracle() {
        assert!(CommandOracle::from_config(&OracleConfig::default()).is_none());
        assert!(matches!(
            NoOracle.complete(&request(Duration::from_secs(1))),
            Err(OracleError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_reads_prompt_from_stdin() {
        let reply = oracle("printf '%s:' \"$GATEKEEPER_TASK\"; cat")
            .complete(&request(Duration::from_secs(5)))
            .expect("reply");
        assert_eq!(reply, "classify:prompt body");
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_reports_timeout_and_failure() {
        let timeout = Duration::from_millis(100);
        assert_eq!(
            oracle("sleep 5").complete(&request(timeout)),
            Err(OracleError::Timeout(timeout))
        );
        assert!(matches!(
            oracle("echo broken >&2; exit 3").complete(&request(Duration::from_secs(5))),
            Err(OracleError::Unavailable(msg)) if msg.contains("broken")
        ));
    }
}
