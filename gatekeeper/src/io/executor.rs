//! Execution sandbox boundary.
//!
//! The [`Executor`] trait is the only path from a verified leaf to a side
//! effect. Each request carries the full verification record so the sandbox
//! can audit what it was handed.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::core::types::{Axes, ExecutionReport, OperationId, VerificationResult};
use crate::io::process::run_command_with_timeout;

/// Parameters for one leaf execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub operation_id: OperationId,
    pub content: String,
    pub axes: Axes,
    /// Every verification result of the approving attempt.
    pub verification: Vec<VerificationResult>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Executor: Send + Sync {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport>;
}

/// Runs the content with `/bin/sh -c`.
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(op = %request.operation_id, axes = %request.axes))]
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport> {
        if request.verification.is_empty() {
            return Err(anyhow!("refusing to execute without verification results"));
        }
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&request.content);
        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("execute operation {}", request.operation_id))?;
        info!(
            exit_code = ?output.status.code(),
            timed_out = output.timed_out,
            "shell execution finished"
        );
        Ok(ExecutionReport {
            success: output.success(),
            exit_code: output.status.code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            duration_ms: u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Records what would run and reports success without side effects.
#[derive(Default)]
pub struct DryRunExecutor {
    seen: Mutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents handed over so far, in order.
    pub fn seen(&self) -> Vec<String> {
        self.seen
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl Executor for DryRunExecutor {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport> {
        info!(op = %request.operation_id, content = %request.content, "dry run: not executing");
        self.seen
            .lock()
            .map_err(|_| anyhow!("dry-run executor lock poisoned"))?
            .push(request.content.clone());
        Ok(ExecutionReport {
            success: true,
            exit_code: None,
            stdout: format!("[dry run] {}", request.content),
            stderr: String::new(),
            duration_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VerificationLayer;

    fn request(content: &str) -> ExecutionRequest {
        ExecutionRequest {
            operation_id: OperationId::new(),
            content: content.to_string(),
            axes: Axes::CONSERVATIVE,
            verification: vec![VerificationResult {
                layer: VerificationLayer::Safety,
                attempt: 1,
                passed: true,
                confidence: 1.0,
                issues: Vec::new(),
                details: String::new(),
                duration_ms: 0,
            }],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn dry_run_records_without_running() {
        let exec = DryRunExecutor::new();
        let report = exec.execute(&request("touch /tmp/never")).expect("report");
        assert!(report.success);
        assert_eq!(exec.seen(), vec!["touch /tmp/never".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn shell_executor_reports_exit_status() {
        let ok = ShellExecutor.execute(&request("echo hi")).expect("run");
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = ShellExecutor.execute(&request("exit 4")).expect("run");
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(4));
    }

    #[test]
    fn shell_executor_requires_verification() {
        let mut req = request("echo hi");
        req.verification.clear();
        assert!(ShellExecutor.execute(&req).is_err());
    }
}
