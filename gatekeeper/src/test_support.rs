//! Test-only collaborators: scripted oracles, recording executors and a
//! static host environment. Nothing here spawns processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::core::examples::FewShotExample;
use crate::core::tree::{AtomicOperation, OperationTree};
use crate::core::types::{Axes, ClassificationPass, ExecutionReport, PassKind};
use crate::gate::{Gatekeeper, GatekeeperBuilder};
use crate::io::config::GateConfig;
use crate::io::dry_run::{DryRunOutcome, DryRunner};
use crate::io::environment::Environment;
use crate::io::executor::{ExecutionRequest, Executor};
use crate::io::memory::MemoryProvider;
use crate::io::oracle::{Oracle, OracleError, OracleRequest, OracleTask};
use crate::safety::SafetyGovernor;
use crate::verify::VerificationContext;

/// JSON reply the classifier accepts.
pub fn classification_reply(axes: Axes, confident: bool) -> String {
    json!({
        "destination": axes.destination.as_str(),
        "consumer": axes.consumer.as_str(),
        "semantics": axes.semantics.as_str(),
        "confident": confident,
        "rationale": "scripted",
    })
    .to_string()
}

/// JSON reply the decomposer accepts.
pub fn decomposition_reply(children: &[&str]) -> String {
    json!({
        "needs_decomposition": !children.is_empty(),
        "sub_requests": children,
        "rationale": "scripted split",
    })
    .to_string()
}

/// Oracle answering from a script keyed by task and subject.
///
/// Unscripted calls fall back to a per-task reply, then to a global reply,
/// and otherwise report the oracle as unavailable.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: HashMap<(OracleTask, String), String>,
    task_fallback: HashMap<OracleTask, String>,
    fallback: Option<String>,
    seen: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn with_task_fallback(mut self, task: OracleTask, reply: impl Into<String>) -> Self {
        self.task_fallback.insert(task, reply.into());
        self
    }

    pub fn classify(mut self, subject: &str, axes: Axes, confident: bool) -> Self {
        self.replies.insert(
            (OracleTask::Classify, subject.to_string()),
            classification_reply(axes, confident),
        );
        self
    }

    pub fn decompose(mut self, subject: &str, children: &[&str]) -> Self {
        self.replies.insert(
            (OracleTask::Decompose, subject.to_string()),
            decomposition_reply(children),
        );
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.seen.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn prompts_for(&self, task: OracleTask) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.task == task)
            .map(|r| r.prompt)
            .collect()
    }
}

impl Oracle for ScriptedOracle {
    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        self.replies
            .get(&(request.task, request.subject.clone()))
            .or_else(|| self.task_fallback.get(&request.task))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                OracleError::Unavailable(format!(
                    "no scripted {} reply for '{}'",
                    request.task.as_str(),
                    request.subject
                ))
            })
    }
}

type OracleFn = dyn Fn(&OracleRequest) -> Result<String, OracleError> + Send + Sync;

/// Oracle backed by a closure.
pub struct FnOracle(Box<OracleFn>);

impl FnOracle {
    pub fn new(
        f: impl Fn(&OracleRequest) -> Result<String, OracleError> + Send + Sync + 'static,
    ) -> Self {
        Self(Box::new(f))
    }
}

impl Oracle for FnOracle {
    fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        (self.0)(request)
    }
}

/// Executor that records requests and reports success unless told otherwise.
#[derive(Default)]
pub struct RecordingExecutor {
    requests: Mutex<Vec<ExecutionRequest>>,
    fail_containing: Option<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a non-zero exit for content containing `needle`.
    pub fn failing_on(needle: &str) -> Self {
        Self {
            requests: Mutex::default(),
            fail_containing: Some(needle.to_string()),
        }
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.content).collect()
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("recording executor lock poisoned"))?
            .push(request.clone());
        let fails = self
            .fail_containing
            .as_deref()
            .is_some_and(|needle| request.content.contains(needle));
        Ok(ExecutionReport {
            success: !fails,
            exit_code: Some(if fails { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if fails { "scripted failure".to_string() } else { String::new() },
            duration_ms: 0,
        })
    }
}

/// Host with a fixed set of tools and paths.
///
/// A path exists when it is listed or is an ancestor of a listed path.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    tools: Vec<String>,
    paths: Vec<PathBuf>,
    permissive: bool,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tool resolves and every path exists.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools.extend(tools.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_paths(mut self, paths: &[&str]) -> Self {
        self.paths.extend(paths.iter().map(PathBuf::from));
        self
    }
}

impl Environment for StaticEnvironment {
    fn resolve_tool(&self, name: &str) -> Option<PathBuf> {
        (self.permissive || self.tools.iter().any(|t| t == name))
            .then(|| PathBuf::from("/usr/bin").join(name))
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.permissive || self.paths.iter().any(|p| p.starts_with(path))
    }
}

/// Dry runner returning a fixed outcome.
#[derive(Debug, Clone)]
pub struct ScriptedDryRun(pub DryRunOutcome);

impl ScriptedDryRun {
    pub fn clean() -> Self {
        Self(DryRunOutcome::Clean)
    }
}

impl DryRunner for ScriptedDryRun {
    fn dry_run(&self, _content: &str, _timeout: Duration) -> DryRunOutcome {
        self.0.clone()
    }
}

/// Memory that returns the same evidence for every request.
#[derive(Debug, Clone, Default)]
pub struct StaticMemory(pub Option<String>);

impl MemoryProvider for StaticMemory {
    fn alignment_evidence(&self, _request: &str) -> Option<String> {
        self.0.clone()
    }
}

/// A classified leaf outside any gate run.
pub fn leaf(request: &str, content: &str, axes: Axes, confident: bool) -> AtomicOperation {
    let mut tree = OperationTree::new(request);
    let id = tree.root_id();
    let pass = ClassificationPass {
        pass_number: 0,
        kind: PassKind::Initial,
        indicators: Vec::new(),
        axes,
        confident,
        rationale: String::new(),
        degraded: None,
    };
    tree.push_pass(id, pass).expect("root exists");
    let mut op = tree.root().clone();
    op.content = content.to_string();
    op
}

/// Owned collaborators for building a [`VerificationContext`] in layer tests.
pub struct LayerFixture {
    pub governor: SafetyGovernor,
    pub environment: StaticEnvironment,
    pub dry_runner: ScriptedDryRun,
    pub memory: Option<StaticMemory>,
    pub corrections: Vec<FewShotExample>,
    pub lineage: Vec<String>,
}

impl Default for LayerFixture {
    fn default() -> Self {
        Self {
            governor: SafetyGovernor::new(&GateConfig::default()),
            environment: StaticEnvironment::permissive(),
            dry_runner: ScriptedDryRun::clean(),
            memory: None,
            corrections: Vec::new(),
            lineage: Vec::new(),
        }
    }
}

impl LayerFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> VerificationContext<'_> {
        VerificationContext {
            session: "test",
            governor: &self.governor,
            environment: &self.environment,
            dry_runner: &self.dry_runner,
            memory: self.memory.as_ref().map(|m| m as &dyn MemoryProvider),
            corrections: &self.corrections,
            lineage: self.lineage.clone(),
            remaining: Duration::from_secs(3600),
            dry_run_timeout: Duration::from_secs(1),
            max_bytes: 4_096,
            now: Instant::now(),
        }
    }
}

/// A gatekeeper wired to `oracle`, a recording executor and a permissive host.
pub fn gatekeeper(oracle: Arc<dyn Oracle>) -> (Gatekeeper, Arc<RecordingExecutor>) {
    gatekeeper_with(GateConfig::default(), oracle)
}

pub fn gatekeeper_with(
    config: GateConfig,
    oracle: Arc<dyn Oracle>,
) -> (Gatekeeper, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::new());
    let gate = builder(config, oracle)
        .executor(executor.clone())
        .build()
        .expect("test config is valid");
    (gate, executor)
}

/// Builder preloaded with deterministic collaborators.
pub fn builder(config: GateConfig, oracle: Arc<dyn Oracle>) -> GatekeeperBuilder {
    GatekeeperBuilder::new(config)
        .oracle(oracle)
        .environment(Arc::new(StaticEnvironment::permissive()))
        .dry_runner(Arc::new(ScriptedDryRun::clean()))
}
