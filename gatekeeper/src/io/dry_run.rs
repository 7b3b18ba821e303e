//! Non-mutating dry runs for the behavioral layer.

use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRunOutcome {
    Clean,
    Problems(String),
    TimedOut,
    Unsupported,
}

pub trait DryRunner: Send + Sync {
    fn dry_run(&self, content: &str, timeout: Duration) -> DryRunOutcome;
}

/// Parses the content with `sh -n`, which reads commands without executing them.
pub struct ShellParseCheck;

impl DryRunner for ShellParseCheck {
    fn dry_run(&self, content: &str, timeout: Duration) -> DryRunOutcome {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-n").arg("-c").arg(content);
        match run_command_with_timeout(cmd, None, timeout, 8 * 1024) {
            Ok(out) if out.timed_out => DryRunOutcome::TimedOut,
            Ok(out) if out.status.success() => DryRunOutcome::Clean,
            Ok(out) => DryRunOutcome::Problems(out.stderr_lossy().trim().to_string()),
            Err(e) => {
                debug!(err = %e, "dry run unavailable");
                DryRunOutcome::Unsupported
            }
        }
    }
}

/// No dry-run support.
pub struct NoDryRun;

impl DryRunner for NoDryRun {
    fn dry_run(&self, _content: &str, _timeout: Duration) -> DryRunOutcome {
        DryRunOutcome::Unsupported
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn parse_check_never_executes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("created");
        let script = format!("touch {}", marker.display());
        assert_eq!(
            ShellParseCheck.dry_run(&script, Duration::from_secs(5)),
            DryRunOutcome::Clean
        );
        assert!(!marker.exists());
    }

    #[test]
    fn parse_check_reports_syntax_errors() {
        let outcome = ShellParseCheck.dry_run("if then fi (", Duration::from_secs(5));
        assert!(matches!(outcome, DryRunOutcome::Problems(_)));
    }
}
