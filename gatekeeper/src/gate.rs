//! Gatekeeper orchestration.
//!
//! [`Gatekeeper::submit`] drives one request through sanitize, classify,
//! decompose, verify and gate. Every status change is appended to the store
//! and every decision to the audit log. The returned [`OperationResult`] is
//! the caller's handle for the follow-up calls ([`Gatekeeper::confirm`],
//! [`Gatekeeper::edit`], [`Gatekeeper::retry`], [`Gatekeeper::decline`] and
//! [`Gatekeeper::cancel`]).
//!
//! Nothing reaches the [`Executor`] without a full pipeline run in the same
//! attempt, and a critical failure is terminal: a failed operation cannot be
//! edited, confirmed or retried.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::agents::decomposer::validate_children;
use crate::agents::{ClassifyInput, Classifier, Decomposer};
use crate::core::compound;
use crate::core::confidence::{ExecutionTier, tier_for};
use crate::core::patterns::changes_system_state;
use crate::core::examples::FewShotExample;
use crate::core::sanitize::sanitize_request;
use crate::core::tree::{AtomicOperation, OperationTree};
use crate::core::types::{
    Axes, ClassificationPass, ExecutionReport, FailureReason, HoldReason, OperationId,
    OperationStatus, PassKind, VerificationLayer,
};
use crate::error::GateError;
use crate::feedback::FeedbackCollector;
use crate::io::audit::{AuditEvent, AuditLog};
use crate::io::config::GateConfig;
use crate::io::dry_run::{DryRunner, ShellParseCheck};
use crate::io::environment::{Environment, SystemEnvironment};
use crate::io::executor::{DryRunExecutor, ExecutionRequest, Executor};
use crate::io::memory::MemoryProvider;
use crate::io::oracle::{NoOracle, Oracle};
use crate::io::store::{MemoryStore, Record, Store};
use crate::safety::{Exhausted, SafetyGovernor, SessionBudget};
use crate::session::SessionContext;
use crate::verify::{Pipeline, PipelineOutcome, VerificationContext};

const FAILURE_DETAIL_CHARS: usize = 200;

/// Something the caller should see about an operation that did not simply run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub operation_id: OperationId,
    pub message: String,
}

/// The tree produced by one submission, plus what happened along the way.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub session: String,
    pub tree: OperationTree,
    pub notices: Vec<Notice>,
    /// Problems recovered locally. None of them stopped the run.
    pub recovered: Vec<GateError>,
}

impl OperationResult {
    fn new(session: &str, tree: OperationTree) -> Self {
        Self {
            session: session.to_string(),
            tree,
            notices: Vec::new(),
            recovered: Vec::new(),
        }
    }

    pub fn root_status(&self) -> OperationStatus {
        self.tree.root().status
    }

    /// Leaves waiting on a human: awaiting approval or held.
    pub fn pending(&self) -> Vec<OperationId> {
        self.tree
            .iter()
            .filter(|op| {
                op.is_leaf()
                    && matches!(
                        op.status,
                        OperationStatus::AwaitingApproval | OperationStatus::Held
                    )
            })
            .map(|op| op.id)
            .collect()
    }

    /// The typed error behind an operation's current state, if it has one.
    pub fn error_for(&self, id: OperationId) -> Option<GateError> {
        let op = self.tree.get(id)?;
        match op.status {
            OperationStatus::Held => match op.hold.as_ref()? {
                HoldReason::RateLimited {
                    category,
                    retry_after,
                } => Some(GateError::RateLimitExceeded {
                    operation_id: id,
                    category: *category,
                    retry_after: *retry_after,
                }),
                HoldReason::SessionPaused { ceiling } => Some(GateError::CircuitBreakerTripped {
                    session: self.session.clone(),
                    ceiling: *ceiling,
                }),
            },
            OperationStatus::Failed => match op.failure.as_ref()? {
                FailureReason::Rejected { layer, issues } => Some(GateError::VerificationRejected {
                    operation_id: id,
                    layer: *layer,
                    issues: issues.clone(),
                }),
                FailureReason::LowConfidence { issues, .. } => {
                    Some(GateError::VerificationRejected {
                        operation_id: id,
                        layer: weakest_layer(op),
                        issues: issues.clone(),
                    })
                }
                FailureReason::Cancelled => Some(GateError::Cancelled),
                FailureReason::ExecutionFailed { .. }
                | FailureReason::UserRejected
                | FailureReason::ChildFailed => None,
            },
            _ => None,
        }
    }

    /// Human-readable reason for an operation's state, naming the layer and
    /// the rule or limit involved.
    pub fn explain(&self, id: OperationId) -> String {
        let Some(op) = self.tree.get(id) else {
            return format!("unknown operation {id}");
        };
        let mut text = match op.status {
            OperationStatus::Failed => match &op.failure {
                Some(reason @ FailureReason::LowConfidence { .. }) => {
                    format!("{reason} (weakest layer: {})", weakest_layer(op))
                }
                Some(reason) => reason.to_string(),
                None => "failed".to_string(),
            },
            OperationStatus::Held => op
                .hold
                .as_ref()
                .map_or_else(|| "held".to_string(), ToString::to_string),
            OperationStatus::AwaitingApproval => format!(
                "awaiting confirmation at confidence {:.2}",
                op.confidence.unwrap_or(0.0)
            ),
            OperationStatus::Complete if op.is_leaf() => match &op.execution {
                Some(report) => match report.exit_code {
                    Some(code) => format!("executed (exit code {code})"),
                    None => "executed".to_string(),
                },
                None => "complete".to_string(),
            },
            OperationStatus::Complete => {
                format!("all {} sub-operations complete", op.children.len())
            }
            OperationStatus::Decomposed => {
                format!("decomposed into {} sub-operations", op.children.len())
            }
            status => status.to_string(),
        };
        let findings = layer_findings(op);
        if !findings.is_empty() && !matches!(op.failure, Some(FailureReason::Rejected { .. })) {
            text.push_str("; ");
            text.push_str(&findings.join("; "));
        }
        text
    }
}

fn weakest_layer(op: &AtomicOperation) -> VerificationLayer {
    op.latest_results()
        .into_iter()
        .min_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map_or(VerificationLayer::Intent, |r| r.layer)
}

fn layer_findings(op: &AtomicOperation) -> Vec<String> {
    op.latest_results()
        .into_iter()
        .filter(|r| !r.issues.is_empty())
        .map(|r| format!("{}: {}", r.layer, r.issues.join(", ")))
        .collect()
}

/// How a verified leaf is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gating {
    /// Tier decides.
    Automatic,
    /// A human approved: anything above the reject tier runs.
    Confirmed,
    /// Content changed: never runs without a fresh confirmation.
    Edited,
}

pub struct GatekeeperBuilder {
    config: GateConfig,
    oracle: Option<Arc<dyn Oracle>>,
    executor: Option<Arc<dyn Executor>>,
    store: Option<Arc<dyn Store>>,
    audit: Option<Arc<AuditLog>>,
    environment: Option<Arc<dyn Environment>>,
    dry_runner: Option<Arc<dyn DryRunner>>,
    memory: Option<Arc<dyn MemoryProvider>>,
}

impl GatekeeperBuilder {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            oracle: None,
            executor: None,
            store: None,
            audit: None,
            environment: None,
            dry_runner: None,
            memory: None,
        }
    }

    pub fn oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn dry_runner(mut self, dry_runner: Arc<dyn DryRunner>) -> Self {
        self.dry_runner = Some(dry_runner);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Validate the config and fill unset collaborators with safe defaults:
    /// no oracle, a dry-run executor and an in-memory store.
    pub fn build(self) -> Result<Gatekeeper, GateError> {
        self.config
            .validate()
            .map_err(|e| GateError::Config(format!("{e:#}")))?;
        let audit = match (self.audit, &self.config.audit.path) {
            (Some(audit), _) => audit,
            (None, Some(path)) => Arc::new(
                AuditLog::with_file(path).map_err(|e| GateError::Config(format!("{e:#}")))?,
            ),
            (None, None) => Arc::new(AuditLog::new()),
        };
        let oracle: Arc<dyn Oracle> = match self.oracle {
            Some(oracle) => oracle,
            None => Arc::new(NoOracle),
        };
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(DryRunExecutor::new()),
        };
        let environment: Arc<dyn Environment> = match self.environment {
            Some(environment) => environment,
            None => Arc::new(SystemEnvironment::from_env()),
        };
        let dry_runner: Arc<dyn DryRunner> = match self.dry_runner {
            Some(dry_runner) => dry_runner,
            None => Arc::new(ShellParseCheck),
        };
        Ok(Gatekeeper {
            classifier: Classifier::new(oracle.clone(), &self.config),
            decomposer: Decomposer::new(oracle, &self.config),
            pipeline: Pipeline::standard(),
            governor: SafetyGovernor::new(&self.config),
            feedback: FeedbackCollector::new(store.clone(), audit.clone()),
            executor,
            store,
            audit,
            environment,
            dry_runner,
            memory: self.memory,
            config: self.config,
        })
    }
}

pub struct Gatekeeper {
    config: GateConfig,
    classifier: Classifier,
    decomposer: Decomposer,
    pipeline: Pipeline,
    governor: SafetyGovernor,
    feedback: FeedbackCollector,
    executor: Arc<dyn Executor>,
    store: Arc<dyn Store>,
    audit: Arc<AuditLog>,
    environment: Arc<dyn Environment>,
    dry_runner: Arc<dyn DryRunner>,
    memory: Option<Arc<dyn MemoryProvider>>,
}

impl Gatekeeper {
    pub fn builder(config: GateConfig) -> GatekeeperBuilder {
        GatekeeperBuilder::new(config)
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    pub fn feedback(&self) -> &FeedbackCollector {
        &self.feedback
    }

    pub fn governor(&self) -> &SafetyGovernor {
        &self.governor
    }

    /// Run one request end to end.
    ///
    /// Only an invalid request or a persistence failure is an `Err`. Blocks,
    /// holds and pending confirmations are states in the returned tree; use
    /// [`OperationResult::error_for`] and [`OperationResult::explain`] on them.
    #[instrument(skip_all, fields(session = %session.id))]
    pub fn submit(
        &self,
        text: &str,
        session: &SessionContext,
    ) -> Result<OperationResult, GateError> {
        let sanitized = sanitize_request(text, self.config.verification.max_request_bytes)?;
        let signatures: Vec<String> = sanitized
            .injection_signatures
            .iter()
            .map(|s| s.to_string())
            .collect();
        if sanitized.is_suspicious() {
            warn!(signatures = ?signatures, "request carries prompt-injection signatures");
        }

        let mut result = OperationResult::new(&session.id, OperationTree::new(sanitized.text));
        let root = result.tree.root_id();
        result.tree.get_mut(root)?.injection_signatures = signatures.clone();
        self.persist_operation(&result.tree, root)?;
        self.audit.record(
            Some(&session.id),
            Some(root),
            AuditEvent::RequestReceived {
                request: result.tree.root().request.clone(),
                injection_signatures: signatures,
            },
        );

        let examples = self.feedback.examples(self.config.classifier.max_examples)?;
        self.expand(&mut result, root, &examples, session)?;

        if !session.is_cancelled() {
            let leaves: Vec<OperationId> = result
                .tree
                .leaf_ids()
                .into_iter()
                .filter(|id| {
                    result
                        .tree
                        .get(*id)
                        .is_some_and(|op| op.status == OperationStatus::Classifying)
                })
                .collect();
            self.verify_and_gate(&mut result, &leaves, session, Gating::Automatic)?;
        }
        if session.is_cancelled() {
            self.cancel_remaining(&mut result)?;
        }
        info!(
            status = %result.root_status(),
            nodes = result.tree.len(),
            pending = result.pending().len(),
            "request processed"
        );
        Ok(result)
    }

    /// Approve a pending leaf. The approval is charged and the full pipeline
    /// runs again before anything executes.
    #[instrument(skip_all, fields(op = %id))]
    pub fn confirm(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        session: &SessionContext,
    ) -> Result<OperationStatus, GateError> {
        require_pending(result, id, "confirm")?;
        if session.is_cancelled() {
            self.cancel_remaining(result)?;
            return status_of(result, id);
        }
        if let Err(limited) = self.governor.charge_approval(Instant::now()) {
            self.hold(result, id, &Exhausted::Rate(limited))?;
            return status_of(result, id);
        }
        self.verify_and_gate(result, &[id], session, Gating::Confirmed)?;
        if session.is_cancelled() {
            self.cancel_remaining(result)?;
        }
        status_of(result, id)
    }

    /// Replace a pending leaf's content and verify it again.
    ///
    /// The edited leaf always waits for a fresh confirmation; a blocked edit
    /// fails it.
    #[instrument(skip_all, fields(op = %id))]
    pub fn edit(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        content: &str,
        session: &SessionContext,
    ) -> Result<OperationStatus, GateError> {
        let op = result.tree.get(id).ok_or(GateError::UnknownOperation(id))?;
        if !op.is_leaf() || op.status.is_terminal() || op.status == OperationStatus::Executing {
            return Err(GateError::InvalidState {
                id,
                status: op.status,
                action: "edit",
            });
        }
        let sanitized = sanitize_request(content, self.config.verification.max_request_bytes)?;
        {
            let op = result.tree.get_mut(id)?;
            op.content = sanitized.text.clone();
            for signature in sanitized.injection_signatures {
                if !op.injection_signatures.iter().any(|s| s == signature) {
                    op.injection_signatures.push(signature.to_string());
                }
            }
        }
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::ContentEdited {
                content: sanitized.text,
            },
        );
        self.verify_and_gate(result, &[id], session, Gating::Edited)?;
        if session.is_cancelled() {
            self.cancel_remaining(result)?;
        }
        status_of(result, id)
    }

    /// Verify and gate a held leaf again.
    #[instrument(skip_all, fields(op = %id))]
    pub fn retry(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        session: &SessionContext,
    ) -> Result<OperationStatus, GateError> {
        let op = result.tree.get(id).ok_or(GateError::UnknownOperation(id))?;
        if op.status != OperationStatus::Held {
            return Err(GateError::InvalidState {
                id,
                status: op.status,
                action: "retry",
            });
        }
        self.verify_and_gate(result, &[id], session, Gating::Automatic)?;
        if session.is_cancelled() {
            self.cancel_remaining(result)?;
        }
        status_of(result, id)
    }

    /// Reject a pending leaf on the user's behalf.
    pub fn decline(&self, result: &mut OperationResult, id: OperationId) -> Result<(), GateError> {
        require_pending(result, id, "decline")?;
        self.fail(result, id, FailureReason::UserRejected)
    }

    /// Fail every non-terminal operation as cancelled.
    pub fn cancel(&self, result: &mut OperationResult) -> Result<(), GateError> {
        self.cancel_remaining(result)
    }

    /// Explicit human continuation after the circuit breaker paused a session.
    pub fn continue_session(&self, session: &str) -> Option<SessionBudget> {
        let budget = self.governor.continue_session(session, Instant::now());
        self.audit
            .record(Some(session), None, AuditEvent::SessionResumed);
        budget
    }

    pub fn end_session(&self, session: &str) -> Option<SessionBudget> {
        let budget = self.governor.end_session(session);
        self.audit.record(Some(session), None, AuditEvent::SessionEnded);
        budget
    }

    /// Classify `id` and, when it needs it, decompose and recurse.
    fn expand(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        examples: &[FewShotExample],
        session: &SessionContext,
    ) -> Result<(), GateError> {
        if session.is_cancelled() {
            return Ok(());
        }
        let (request, depth, flagged) = {
            let op = result.tree.require(id)?;
            (
                op.request.clone(),
                op.depth,
                !op.injection_signatures.is_empty(),
            )
        };

        let classification = self.classifier.classify(&ClassifyInput {
            request: &request,
            hints: &session.hints,
            examples,
            injection_flagged: flagged,
        });
        if let Some(reason) = &classification.degraded {
            self.audit.record(
                Some(&result.session),
                Some(id),
                AuditEvent::DegradedMode {
                    reason: reason.clone(),
                },
            );
            result.recovered.push(GateError::ClassificationUnavailable {
                operation_id: id,
                reason: reason.clone(),
            });
        }
        let pass = self.push_pass(result, id, classification.into_pass(PassKind::Initial))?;
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::Classified {
                axes: pass.axes,
                confident: pass.confident,
                pass_number: pass.pass_number,
            },
        );

        let limits = &self.config.decomposition;
        let is_compound = compound::detect(&request, limits.long_request_words).is_compound();
        if pass.confident && !is_compound {
            return Ok(());
        }
        if depth >= limits.max_depth {
            let reason = format!("maximum depth {} reached", limits.max_depth);
            return self.force_leaf(result, id, &pass, reason);
        }
        if session.is_cancelled() {
            return Ok(());
        }

        let proposal = self.decomposer.propose(&request, Some(&pass.rationale));
        let children = match validate_children(&request, &proposal.sub_requests) {
            Ok(children) => children,
            Err(rejected) => {
                debug!(op = %id, reason = %rejected, "decomposition not applied");
                self.audit.record(
                    Some(&result.session),
                    Some(id),
                    AuditEvent::DecompositionRejected {
                        reason: rejected.to_string(),
                    },
                );
                return Ok(());
            }
        };
        if result.tree.len() + children.len() > limits.max_nodes {
            let reason = format!("node limit {} reached", limits.max_nodes);
            return self.force_leaf(result, id, &pass, reason);
        }

        let signatures = result.tree.require(id)?.injection_signatures.clone();
        let child_ids = result.tree.add_children(id, children)?;
        for child in &child_ids {
            result.tree.get_mut(*child)?.injection_signatures = signatures.clone();
            self.persist_operation(&result.tree, *child)?;
        }
        let marker = ClassificationPass {
            pass_number: 0,
            kind: PassKind::Decomposed,
            indicators: vec![format!("children:{}", child_ids.len())],
            axes: pass.axes,
            confident: pass.confident,
            rationale: proposal.rationale,
            degraded: None,
        };
        self.push_pass(result, id, marker)?;
        self.set_status(result, id, OperationStatus::Decomposed, None)?;
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::Decomposed {
                children: child_ids.len(),
            },
        );
        info!(
            op = %id,
            children = child_ids.len(),
            source = ?proposal.source,
            "request decomposed"
        );

        for child in child_ids {
            self.expand(result, child, examples, session)?;
        }
        Ok(())
    }

    fn force_leaf(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        prior: &ClassificationPass,
        reason: String,
    ) -> Result<(), GateError> {
        warn!(op = %id, reason = %reason, "decomposition bounds reached; forcing leaf");
        let depth = result.tree.require(id)?.depth;
        let pass = ClassificationPass {
            pass_number: 0,
            kind: PassKind::ForcedLeaf,
            indicators: prior.indicators.clone(),
            axes: Axes::CONSERVATIVE,
            confident: false,
            rationale: reason.clone(),
            degraded: None,
        };
        self.push_pass(result, id, pass)?;
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::ForcedLeaf {
                reason: reason.clone(),
            },
        );
        result.recovered.push(GateError::DecompositionBoundsExceeded {
            operation_id: id,
            depth,
            nodes: result.tree.len(),
            reason,
        });
        Ok(())
    }

    /// Run a fresh pipeline attempt for each leaf, then gate each one.
    fn verify_and_gate(
        &self,
        result: &mut OperationResult,
        ids: &[OperationId],
        session: &SessionContext,
        gating: Gating,
    ) -> Result<(), GateError> {
        if ids.is_empty() {
            return Ok(());
        }
        let corrections = self.feedback.corrections()?;
        let mut attempts = Vec::with_capacity(ids.len());
        for id in ids {
            let op = result.tree.get_mut(*id)?;
            op.attempt += 1;
            attempts.push((*id, op.attempt));
        }
        let outcomes = self.run_pipelines(
            &result.tree,
            &attempts,
            session,
            &corrections,
            Instant::now(),
        );
        for ((id, attempt), outcome) in attempts.into_iter().zip(outcomes) {
            self.apply_outcome(result, id, attempt, outcome, session, gating)?;
        }
        Ok(())
    }

    fn run_pipelines(
        &self,
        tree: &OperationTree,
        attempts: &[(OperationId, u32)],
        session: &SessionContext,
        corrections: &[FewShotExample],
        now: Instant,
    ) -> Vec<PipelineOutcome> {
        if !self.config.verification.parallel_siblings || attempts.len() < 2 {
            return attempts
                .iter()
                .map(|&(id, attempt)| self.verify_one(tree, id, attempt, session, corrections, now))
                .collect();
        }
        thread::scope(|scope| {
            let handles: Vec<_> = attempts
                .iter()
                .map(|&(id, attempt)| {
                    scope.spawn(move || {
                        self.verify_one(tree, id, attempt, session, corrections, now)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        error!("verification worker panicked; failing closed");
                        incomplete_verification()
                    })
                })
                .collect()
        })
    }

    fn verify_one(
        &self,
        tree: &OperationTree,
        id: OperationId,
        attempt: u32,
        session: &SessionContext,
        corrections: &[FewShotExample],
        now: Instant,
    ) -> PipelineOutcome {
        let Some(op) = tree.get(id) else {
            return incomplete_verification();
        };
        let lineage = tree
            .ancestors(id)
            .into_iter()
            .filter_map(|ancestor| tree.get(ancestor))
            .map(|ancestor| ancestor.request.clone())
            .collect();
        let ctx = VerificationContext {
            session: &session.id,
            governor: &self.governor,
            environment: &*self.environment,
            dry_runner: &*self.dry_runner,
            memory: self.memory.as_deref(),
            corrections,
            lineage,
            remaining: self.governor.remaining_time(&session.id, now),
            dry_run_timeout: self.config.verification.dry_run_timeout(),
            max_bytes: self.config.verification.max_request_bytes,
            now,
        };
        self.pipeline.run(op, &ctx, attempt, &session.cancel)
    }

    fn apply_outcome(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        attempt: u32,
        mut outcome: PipelineOutcome,
        session: &SessionContext,
        gating: Gating,
    ) -> Result<(), GateError> {
        for verification in &outcome.results {
            self.store.insert(Record::Verification {
                operation_id: id,
                result: verification.clone(),
            })?;
        }
        {
            let op = result.tree.get_mut(id)?;
            op.verifications.extend(outcome.results.iter().cloned());
            op.confidence = Some(outcome.confidence);
        }
        if outcome.cancelled {
            return Ok(());
        }
        if let Some((layer, issues)) = outcome.blocking.take() {
            self.audit.record(
                Some(&result.session),
                Some(id),
                AuditEvent::Blocked {
                    layer,
                    issues: issues.clone(),
                },
            );
            return self.fail(result, id, FailureReason::Rejected { layer, issues });
        }
        if let Some(exhausted) = &outcome.exhausted {
            return self.hold(result, id, exhausted);
        }

        let confidence = outcome.confidence;
        let mut tier = tier_for(
            confidence,
            &self.config.thresholds,
            session.preferences.allow_auto_execute,
        );
        // An unconfident classification never runs a state-changing command unasked.
        let guarded = {
            let op = result.tree.require(id)?;
            !op.is_confident() && changes_system_state(&op.content)
        };
        if guarded && tier.executes_immediately() {
            tier = ExecutionTier::RequireConfirmation;
        }
        result.tree.get_mut(id)?.tier = Some(tier);
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::Verified {
                attempt,
                confidence,
                tier,
            },
        );
        debug!(op = %id, confidence, tier = ?tier, ?gating, guarded, "leaf verified");

        match (gating, tier) {
            (Gating::Edited, _) => self.await_approval(
                result,
                id,
                format!("content edited; confirm to run (confidence {confidence:.2})"),
            ),
            (_, ExecutionTier::Reject) => self.fail(
                result,
                id,
                FailureReason::LowConfidence {
                    confidence,
                    issues: outcome.issues(),
                },
            ),
            (Gating::Confirmed, _) | (Gating::Automatic, ExecutionTier::AutoExecute) => {
                self.execute(result, id, session)
            }
            (Gating::Automatic, ExecutionTier::ExecuteWithNotice) => {
                let mut message = format!("executing at confidence {confidence:.2}");
                let issues = outcome.issues();
                if !issues.is_empty() {
                    message.push_str(": ");
                    message.push_str(&issues.join("; "));
                }
                result.notices.push(Notice {
                    operation_id: id,
                    message,
                });
                self.execute(result, id, session)
            }
            (Gating::Automatic, ExecutionTier::RequireConfirmation) if guarded => {
                self.await_approval(
                    result,
                    id,
                    format!(
                        "unconfident classification of a state-changing command; \
                         confirm to run (confidence {confidence:.2})"
                    ),
                )
            }
            (Gating::Automatic, ExecutionTier::RequireConfirmation) => self.await_approval(
                result,
                id,
                format!("confirmation required (confidence {confidence:.2})"),
            ),
        }
    }

    /// Admit, run and record one verified leaf.
    fn execute(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        session: &SessionContext,
    ) -> Result<(), GateError> {
        let request = {
            let op = result.tree.require(id)?;
            ExecutionRequest {
                operation_id: id,
                content: op.content.clone(),
                axes: op.axes(),
                verification: op.latest_results().into_iter().cloned().collect(),
                timeout: Duration::from_secs(self.config.execution.timeout_secs),
                output_limit_bytes: self.config.execution.output_limit_bytes,
            }
        };
        let attempt = result.tree.require(id)?.attempt;
        let admission = match self.governor.admit(&session.id, &request.content, Instant::now()) {
            Ok(admission) => admission,
            Err(exhausted) => return self.hold(result, id, &exhausted),
        };
        if session.is_cancelled() {
            self.governor.release(&admission);
            return Ok(());
        }

        self.set_status(result, id, OperationStatus::Executing, None)?;
        let (success, exit_code) = match self.executor.execute(&request) {
            Ok(report) => {
                let outcome = (report.success, report.exit_code);
                let detail = failure_detail(&report);
                result.tree.get_mut(id)?.execution = Some(report);
                if outcome.0 {
                    self.set_status(result, id, OperationStatus::Complete, None)?;
                    self.refresh(result, id)?;
                } else {
                    self.fail(result, id, FailureReason::ExecutionFailed { detail })?;
                }
                outcome
            }
            Err(e) => {
                warn!(op = %id, err = %format!("{e:#}"), "executor failed");
                self.fail(
                    result,
                    id,
                    FailureReason::ExecutionFailed {
                        detail: format!("{e:#}"),
                    },
                )?;
                (false, None)
            }
        };
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::Executed { success, exit_code },
        );
        self.feedback.record_execution(id, attempt, success)?;
        info!(op = %id, success, ?exit_code, "operation executed");
        Ok(())
    }

    fn await_approval(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        message: String,
    ) -> Result<(), GateError> {
        self.set_status(
            result,
            id,
            OperationStatus::AwaitingApproval,
            Some(message.clone()),
        )?;
        result.notices.push(Notice {
            operation_id: id,
            message,
        });
        Ok(())
    }

    fn hold(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        exhausted: &Exhausted,
    ) -> Result<(), GateError> {
        let reason = exhausted.hold_reason();
        let text = reason.to_string();
        let seq = result.tree.hold(id, reason)?;
        self.record_status(result, id, seq, OperationStatus::Held, Some(text.clone()))?;
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::Held {
                reason: text.clone(),
            },
        );
        if let Exhausted::Circuit(tripped) = exhausted {
            self.audit.record(
                Some(&result.session),
                Some(id),
                AuditEvent::SessionPaused {
                    ceiling: tripped.ceiling,
                },
            );
        }
        info!(op = %id, reason = %exhausted, "operation held");
        result.notices.push(Notice {
            operation_id: id,
            message: text,
        });
        Ok(())
    }

    fn fail(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        reason: FailureReason,
    ) -> Result<(), GateError> {
        let text = reason.to_string();
        let seq = result.tree.fail(id, reason)?;
        self.record_status(result, id, seq, OperationStatus::Failed, Some(text))?;
        self.refresh(result, id)
    }

    fn cancel_remaining(&self, result: &mut OperationResult) -> Result<(), GateError> {
        let open: Vec<OperationId> = result
            .tree
            .iter()
            .filter(|op| !op.status.is_terminal())
            .map(|op| op.id)
            .collect();
        for id in &open {
            let seq = result.tree.fail(*id, FailureReason::Cancelled)?;
            self.record_status(
                result,
                *id,
                seq,
                OperationStatus::Failed,
                Some(FailureReason::Cancelled.to_string()),
            )?;
            self.audit
                .record(Some(&result.session), Some(*id), AuditEvent::Cancelled);
        }
        if !open.is_empty() {
            info!(cancelled = open.len(), "operations cancelled");
        }
        Ok(())
    }

    fn set_status(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        status: OperationStatus,
        reason: Option<String>,
    ) -> Result<(), GateError> {
        let seq = result.tree.transition(id, status)?;
        self.record_status(result, id, seq, status, reason)
    }

    /// Resolve decomposed ancestors whose children have all finished.
    fn refresh(&self, result: &mut OperationResult, id: OperationId) -> Result<(), GateError> {
        for (ancestor, status, seq) in result.tree.refresh_ancestors(id)? {
            let reason = result
                .tree
                .require(ancestor)?
                .failure
                .as_ref()
                .map(ToString::to_string);
            self.record_status(result, ancestor, seq, status, reason)?;
        }
        Ok(())
    }

    fn record_status(
        &self,
        result: &OperationResult,
        id: OperationId,
        seq: u32,
        status: OperationStatus,
        reason: Option<String>,
    ) -> Result<(), GateError> {
        self.store.insert(Record::Status {
            operation_id: id,
            seq,
            status,
            reason: reason.clone(),
            at: Utc::now(),
        })?;
        self.audit.record(
            Some(&result.session),
            Some(id),
            AuditEvent::StatusChanged { status, reason },
        );
        Ok(())
    }

    fn push_pass(
        &self,
        result: &mut OperationResult,
        id: OperationId,
        pass: ClassificationPass,
    ) -> Result<ClassificationPass, GateError> {
        let pass = result.tree.push_pass(id, pass)?;
        self.store.insert(Record::Pass {
            operation_id: id,
            request: result.tree.require(id)?.request.clone(),
            pass: pass.clone(),
            recorded_at: Utc::now(),
        })?;
        Ok(pass)
    }

    fn persist_operation(&self, tree: &OperationTree, id: OperationId) -> Result<(), GateError> {
        let op = tree.require(id)?;
        self.store.insert(Record::Operation {
            id,
            parent: op.parent,
            request: op.request.clone(),
            created_at: op.created_at,
        })?;
        Ok(())
    }
}

fn require_pending(
    result: &OperationResult,
    id: OperationId,
    action: &'static str,
) -> Result<(), GateError> {
    let op = result.tree.get(id).ok_or(GateError::UnknownOperation(id))?;
    if !op.is_leaf()
        || !matches!(
            op.status,
            OperationStatus::AwaitingApproval | OperationStatus::Held
        )
    {
        return Err(GateError::InvalidState {
            id,
            status: op.status,
            action,
        });
    }
    Ok(())
}

fn status_of(result: &OperationResult, id: OperationId) -> Result<OperationStatus, GateError> {
    Ok(result.tree.require(id)?.status)
}

/// Stand-in for a pipeline run that never finished. Blocks at safety.
fn incomplete_verification() -> PipelineOutcome {
    PipelineOutcome {
        results: Vec::new(),
        blocking: Some((
            VerificationLayer::Safety,
            vec!["verification did not complete".to_string()],
        )),
        exhausted: None,
        confidence: 0.0,
        cancelled: false,
    }
}

fn failure_detail(report: &ExecutionReport) -> String {
    let stderr = report.stderr.trim();
    match stderr.lines().next() {
        Some(line) if !line.is_empty() => line.chars().take(FAILURE_DETAIL_CHARS).collect(),
        _ => match report.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated without exit code".to_string(),
        },
    }
}
