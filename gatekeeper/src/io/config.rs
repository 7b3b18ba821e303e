//! Gatekeeper configuration (TOML).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::confidence::Thresholds;
use crate::core::examples::MAX_EXAMPLES;
use crate::core::types::RateCategory;

/// Top-level configuration.
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub decomposition: DecompositionConfig,
    pub rate_limits: RateLimitsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub thresholds: Thresholds,
    pub oracle: OracleConfig,
    pub classifier: ClassifierConfig,
    pub verification: VerificationConfig,
    pub execution: ExecutionConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecompositionConfig {
    /// Deepest level a node may be decomposed to; nodes at this depth become forced leaves.
    pub max_depth: u32,
    /// Upper bound on nodes in one request's tree.
    pub max_nodes: usize,
    /// Requests with more words than this are treated as compound.
    pub long_request_words: usize,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_nodes: 25,
            long_request_words: 40,
        }
    }
}

/// One sliding window: at most `max_requests` within `window_secs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub sudo: RateLimit,
    pub service: RateLimit,
    pub container: RateLimit,
    pub package: RateLimit,
    pub approval: RateLimit,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            sudo: RateLimit::new(10, 60),
            service: RateLimit::new(20, 60),
            container: RateLimit::new(30, 60),
            package: RateLimit::new(5, 300),
            approval: RateLimit::new(20, 60),
        }
    }
}

impl RateLimitsConfig {
    pub fn limit_for(&self, category: RateCategory) -> RateLimit {
        match category {
            RateCategory::Sudo => self.sudo,
            RateCategory::Service => self.service,
            RateCategory::Container => self.container,
            RateCategory::Package => self.package,
            RateCategory::Approval => self.approval,
        }
    }
}

/// Hard per-session ceilings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub max_operations: u32,
    pub max_seconds: u64,
    pub max_escalations: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_operations: 25,
            max_seconds: 300,
            max_escalations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that reads a prompt on stdin and writes a reply on stdout.
    /// Empty disables the oracle; classification then runs in degraded mode.
    pub command: Vec<String>,
    pub timeout_ms: u64,
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_ms: 5_000,
            output_limit_bytes: 64 * 1024,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub max_examples: usize,
    pub prompt_budget_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_examples: MAX_EXAMPLES,
            prompt_budget_bytes: 16_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Verify sibling leaves on separate threads.
    pub parallel_siblings: bool,
    pub dry_run_timeout_ms: u64,
    pub max_request_bytes: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            parallel_siblings: true,
            dry_run_timeout_ms: 2_000,
            max_request_bytes: 4_096,
        }
    }
}

impl VerificationConfig {
    pub fn dry_run_timeout(&self) -> Duration {
        Duration::from_millis(self.dry_run_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Append audit entries as JSON lines to this file.
    pub path: Option<PathBuf>,
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        let d = &self.decomposition;
        if d.max_depth == 0 {
            return Err(anyhow!("decomposition.max_depth must be > 0"));
        }
        if d.max_nodes == 0 {
            return Err(anyhow!("decomposition.max_nodes must be > 0"));
        }
        if d.long_request_words == 0 {
            return Err(anyhow!("decomposition.long_request_words must be > 0"));
        }
        for category in RateCategory::ALL {
            let limit = self.rate_limits.limit_for(category);
            if !(1..=100).contains(&limit.max_requests) {
                return Err(anyhow!(
                    "rate_limits.{category}.max_requests must be within 1..=100"
                ));
            }
            if !(10..=600).contains(&limit.window_secs) {
                return Err(anyhow!(
                    "rate_limits.{category}.window_secs must be within 10..=600"
                ));
            }
        }
        let cb = &self.circuit_breaker;
        if cb.max_operations == 0 || cb.max_seconds == 0 || cb.max_escalations == 0 {
            return Err(anyhow!("circuit_breaker ceilings must be > 0"));
        }
        if !self.thresholds.is_ordered() {
            return Err(anyhow!(
                "thresholds must satisfy 0 < confirm < notify < auto_execute <= 1"
            ));
        }
        if self.oracle.timeout_ms == 0 {
            return Err(anyhow!("oracle.timeout_ms must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if let Some(program) = self.oracle.command.first()
            && program.trim().is_empty()
        {
            return Err(anyhow!("oracle.command must start with a program"));
        }
        if self.classifier.max_examples > MAX_EXAMPLES {
            return Err(anyhow!(
                "classifier.max_examples must be <= {MAX_EXAMPLES}"
            ));
        }
        if self.classifier.prompt_budget_bytes == 0 {
            return Err(anyhow!("classifier.prompt_budget_bytes must be > 0"));
        }
        if self.verification.dry_run_timeout_ms == 0 {
            return Err(anyhow!("verification.dry_run_timeout_ms must be > 0"));
        }
        if self.verification.max_request_bytes == 0 {
            return Err(anyhow!("verification.max_request_bytes must be > 0"));
        }
        if self.execution.timeout_secs == 0 || self.execution.output_limit_bytes == 0 {
            return Err(anyhow!("execution timeout and output limit must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GateConfig::default()`.
pub fn load_config(path: &Path) -> Result<GateConfig> {
    if !path.exists() {
        let cfg = GateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GateConfig) -> Result<()> {
    cfg.validate()?;
    let buf = render_config(cfg)?;
    write_atomic(path, &buf)
}

pub fn render_config(cfg: &GateConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    Ok(buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, GateConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gate").join("config.toml");
        let mut cfg = GateConfig::default();
        cfg.oracle.command = vec!["llm".to_string(), "--json".to_string()];
        cfg.audit.path = Some(temp.path().join("audit.jsonl"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Partial files keep defaults for everything they omit.
    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[rate_limits.package]\nmax_requests = 2\nwindow_secs = 30\n\n[decomposition]\nmax_depth = 2\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.rate_limits.package, RateLimit::new(2, 30));
        assert_eq!(cfg.rate_limits.sudo, RateLimit::new(10, 60));
        assert_eq!(cfg.decomposition.max_depth, 2);
        assert_eq!(cfg.decomposition.max_nodes, 25);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = GateConfig::default();
        cfg.rate_limits.sudo = RateLimit::new(0, 60);
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.rate_limits.package.window_secs = 5;
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.thresholds.notify = 0.95;
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.classifier.max_examples = 11;
        assert!(cfg.validate().is_err());
    }
}
