//! End-to-end gate scenarios against scripted collaborators.
//!
//! Every test drives the public `Gatekeeper` surface: submit, then the
//! follow-up calls, then checks the tree, the executor and the audit chain.

use std::sync::Arc;

use gatekeeper::core::confidence::ExecutionTier;
use gatekeeper::core::invariants::validate_invariants;
use gatekeeper::core::types::{
    Axes, Ceiling, Consumer, Destination, FailureReason, FeedbackKind, OperationStatus,
    RateCategory, Semantics, VerificationLayer,
};
use gatekeeper::io::audit::AuditEvent;
use gatekeeper::io::config::{GateConfig, RateLimit};
use gatekeeper::io::oracle::{OracleError, OracleTask};
use gatekeeper::test_support::{
    FnOracle, ScriptedOracle, classification_reply, decomposition_reply, gatekeeper,
    gatekeeper_with,
};
use gatekeeper::{GateError, SessionContext, UserPreferences};

fn read_axes() -> Axes {
    Axes::new(Destination::Stream, Consumer::Human, Semantics::Read)
}

fn confirming_session(id: &str) -> SessionContext {
    SessionContext::new(id).with_preferences(UserPreferences {
        allow_auto_execute: false,
    })
}

fn execute_axes() -> Axes {
    Axes::new(Destination::Process, Consumer::Machine, Semantics::Execute)
}

fn has_event(gate: &gatekeeper::Gatekeeper, pred: impl Fn(&AuditEvent) -> bool) -> bool {
    gate.audit().entries().iter().any(|entry| pred(&entry.event))
}

#[test]
fn root_deletion_is_blocked_and_never_executed() {
    let (gate, executor) = gatekeeper(Arc::new(ScriptedOracle::new()));
    let result = gate
        .submit("rm -rf /", &SessionContext::new("s"))
        .expect("submit");
    let root = result.tree.root_id();

    assert_eq!(result.root_status(), OperationStatus::Failed);
    assert!(matches!(
        result.error_for(root),
        Some(GateError::VerificationRejected {
            layer: VerificationLayer::Safety,
            ..
        })
    ));
    assert!(result.explain(root).contains("recursive deletion of root"));
    assert!(executor.executed().is_empty());
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::Blocked { .. })));
    gate.audit().verify_chain().expect("audit chain intact");
}

#[test]
fn respelled_root_deletion_is_blocked_even_when_confidently_classified() {
    for text in ["rm -rf //", "rm -rf '/'", "rm -rf /.", "rm -rf ${HOME}", "rm -rf /home"] {
        let oracle = ScriptedOracle::new().classify(text, execute_axes(), true);
        let (gate, executor) = gatekeeper(Arc::new(oracle));
        let result = gate.submit(text, &SessionContext::new("s")).expect("submit");
        let root = result.tree.root_id();

        assert_eq!(result.root_status(), OperationStatus::Failed, "{text}");
        assert_eq!(result.tree.root().confidence, Some(0.0), "{text}");
        assert!(
            matches!(
                result.error_for(root),
                Some(GateError::VerificationRejected {
                    layer: VerificationLayer::Safety,
                    ..
                })
            ),
            "{text}"
        );
        assert!(executor.executed().is_empty(), "{text}");
    }
}

#[test]
fn confident_read_auto_executes_above_the_top_threshold() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let result = gate
        .submit("show memory usage", &SessionContext::new("s"))
        .expect("submit");
    let root = result.tree.root();

    assert!(root.children.is_empty());
    assert_eq!(root.tier, Some(ExecutionTier::AutoExecute));
    assert!(root.confidence.expect("scored") >= 0.9);
    assert!(root.latest_results().iter().all(|r| r.passed));
    assert_eq!(result.root_status(), OperationStatus::Complete);
    assert!(result.notices.is_empty());
    assert_eq!(executor.executed(), vec!["show memory usage".to_string()]);
}

#[test]
fn replaying_a_request_reproduces_its_outcome() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, _) = gatekeeper(Arc::new(oracle));
    let session = SessionContext::new("s");
    let first = gate.submit("show memory usage", &session).expect("first");
    let second = gate.submit("show memory usage", &session).expect("second");

    let summary = |result: &gatekeeper::OperationResult| {
        let root = result.tree.root();
        let layers: Vec<_> = root
            .latest_results()
            .iter()
            .map(|r| (r.layer, r.passed, r.confidence, r.issues.clone()))
            .collect();
        (root.axes(), root.is_confident(), root.confidence, root.tier, layers)
    };
    assert_eq!(summary(&first), summary(&second));
    assert_eq!(first.root_status(), second.root_status());
}

#[test]
fn unconfident_split_resolves_the_parent_only_after_both_children() {
    let request = "check logs and restart the service";
    let oracle = ScriptedOracle::new()
        .classify(request, Axes::CONSERVATIVE, false)
        .decompose(request, &["check logs", "restart the service"])
        .classify("check logs", read_axes(), true)
        .classify("restart the service", execute_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let session = confirming_session("s");
    let mut result = gate.submit(request, &session).expect("submit");

    let children = result.tree.root().children.clone();
    let contents: Vec<&str> = children
        .iter()
        .map(|id| result.tree.get(*id).expect("child").content.as_str())
        .collect();
    assert_eq!(contents, vec!["check logs", "restart the service"]);
    assert_eq!(result.root_status(), OperationStatus::Decomposed);
    for id in &children {
        let child = result.tree.get(*id).expect("child");
        assert_eq!(child.status, OperationStatus::AwaitingApproval);
        assert_eq!(child.latest_results().len(), 5);
    }

    let status = gate.confirm(&mut result, children[0], &session).expect("confirm");
    assert_eq!(status, OperationStatus::Complete);
    assert_eq!(result.root_status(), OperationStatus::Decomposed);

    let status = gate.confirm(&mut result, children[1], &session).expect("confirm");
    assert_eq!(status, OperationStatus::Complete);
    assert_eq!(result.root_status(), OperationStatus::Complete);
    assert_eq!(
        executor.executed(),
        vec!["check logs".to_string(), "restart the service".to_string()]
    );
    assert!(validate_invariants(&result.tree).is_empty());
}

#[test]
fn degraded_classification_never_runs_privileged_commands_unasked() {
    for text in [
        "sudo shutdown -h now",
        "sudo userdel -r alice",
        "sudo systemctl stop sshd",
    ] {
        let (gate, executor) = gatekeeper(Arc::new(ScriptedOracle::new()));
        let session = SessionContext::new("s");
        let mut result = gate.submit(text, &session).expect("submit");
        let root = result.tree.root_id();

        assert_eq!(result.tree.root().axes(), Axes::CONSERVATIVE, "{text}");
        assert_eq!(result.root_status(), OperationStatus::AwaitingApproval, "{text}");
        assert_eq!(
            result.tree.root().tier,
            Some(ExecutionTier::RequireConfirmation),
            "{text}"
        );
        assert!(
            result
                .notices
                .iter()
                .any(|n| n.message.contains("state-changing command")),
            "{text}"
        );
        assert!(executor.executed().is_empty(), "{text}");

        let status = gate.confirm(&mut result, root, &session).expect("confirm");
        assert_eq!(status, OperationStatus::Complete, "{text}");
        assert_eq!(executor.executed(), vec![text.to_string()]);
    }
}

#[test]
fn package_rate_limit_holds_the_request_past_the_window_budget() {
    let mut config = GateConfig::default();
    config.rate_limits.package = RateLimit::new(2, 300);
    let request = "apt-get install htop";
    let oracle = ScriptedOracle::new().classify(request, execute_axes(), true);
    let (gate, executor) = gatekeeper_with(config, Arc::new(oracle));
    let session = SessionContext::new("s");

    for _ in 0..2 {
        let result = gate.submit(request, &session).expect("submit");
        assert_eq!(result.root_status(), OperationStatus::Complete);
    }
    let third = gate.submit(request, &session).expect("third");
    let root = third.tree.root_id();
    assert_eq!(third.root_status(), OperationStatus::Held);
    assert!(matches!(
        third.error_for(root),
        Some(GateError::RateLimitExceeded {
            category: RateCategory::Package,
            ..
        })
    ));
    assert_eq!(executor.executed().len(), 2);
}

#[test]
fn compound_request_is_split_and_every_child_runs() {
    let request = "check disk usage and show memory usage";
    let oracle = ScriptedOracle::new()
        .classify(request, read_axes(), false)
        .decompose(request, &["check disk usage", "show memory usage"])
        .classify("check disk usage", read_axes(), true)
        .classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let result = gate.submit(request, &SessionContext::new("s")).expect("submit");

    assert_eq!(result.tree.len(), 3);
    assert_eq!(result.tree.root().children.len(), 2);
    assert_eq!(result.root_status(), OperationStatus::Complete);
    let mut executed = executor.executed();
    executed.sort();
    assert_eq!(
        executed,
        vec!["check disk usage".to_string(), "show memory usage".to_string()]
    );
    for id in result.tree.leaf_ids() {
        let leaf = result.tree.get(id).expect("leaf");
        assert_eq!(leaf.depth, 1);
        assert_eq!(leaf.latest_results().len(), 5);
    }
    assert!(validate_invariants(&result.tree).is_empty());
    gate.audit().verify_chain().expect("audit chain intact");
}

#[test]
fn unavailable_oracle_degrades_to_conservative_axes() {
    let (gate, executor) = gatekeeper(Arc::new(ScriptedOracle::new()));
    let result = gate
        .submit("show memory usage", &SessionContext::new("s"))
        .expect("submit");

    let root = result.tree.root();
    assert_eq!(root.axes(), Axes::CONSERVATIVE);
    assert!(!root.is_confident());
    assert!(
        result
            .recovered
            .iter()
            .any(|e| matches!(e, GateError::ClassificationUnavailable { .. }))
    );
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::DegradedMode { .. })));
    // Lower confidence still clears the notify tier for a plain read.
    assert_eq!(result.root_status(), OperationStatus::Complete);
    assert!(!result.notices.is_empty());
    assert_eq!(executor.executed(), vec!["show memory usage".to_string()]);
}

#[test]
fn editing_pending_content_cannot_bypass_a_block() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let session = confirming_session("s");
    let mut result = gate.submit("show memory usage", &session).expect("submit");
    let root = result.tree.root_id();
    assert_eq!(result.root_status(), OperationStatus::AwaitingApproval);

    let status = gate
        .edit(&mut result, root, "rm -rf /", &session)
        .expect("edit");
    assert_eq!(status, OperationStatus::Failed);
    assert!(matches!(
        result.tree.root().failure,
        Some(FailureReason::Rejected {
            layer: VerificationLayer::Safety,
            ..
        })
    ));
    assert!(matches!(
        gate.confirm(&mut result, root, &session),
        Err(GateError::InvalidState { .. })
    ));
    assert!(executor.executed().is_empty());
}

#[test]
fn edited_content_waits_for_a_fresh_confirmation() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let session = confirming_session("s");
    let mut result = gate.submit("show memory usage", &session).expect("submit");
    let root = result.tree.root_id();

    let status = gate
        .edit(&mut result, root, "show disk usage", &session)
        .expect("edit");
    assert_eq!(status, OperationStatus::AwaitingApproval);
    assert!(executor.executed().is_empty());
    assert_eq!(result.tree.root().attempt, 2);

    let status = gate.confirm(&mut result, root, &session).expect("confirm");
    assert_eq!(status, OperationStatus::Complete);
    assert_eq!(executor.executed(), vec!["show disk usage".to_string()]);
    assert_eq!(result.tree.root().attempt, 3);
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::ContentEdited { .. })));
}

#[test]
fn cancelling_before_submit_runs_nothing() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let session = SessionContext::new("s");
    session.cancel.cancel();

    let result = gate.submit("show memory usage", &session).expect("submit");
    let root = result.tree.root_id();
    assert_eq!(result.root_status(), OperationStatus::Failed);
    assert_eq!(result.tree.root().failure, Some(FailureReason::Cancelled));
    assert!(matches!(result.error_for(root), Some(GateError::Cancelled)));
    assert!(executor.executed().is_empty());
}

#[test]
fn cancel_fails_pending_operations() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let session = confirming_session("s");
    let mut result = gate.submit("show memory usage", &session).expect("submit");
    let root = result.tree.root_id();
    assert_eq!(result.pending(), vec![root]);

    gate.cancel(&mut result).expect("cancel");
    assert_eq!(result.root_status(), OperationStatus::Failed);
    assert!(result.pending().is_empty());
    assert!(matches!(
        gate.confirm(&mut result, root, &session),
        Err(GateError::InvalidState { .. })
    ));
    assert!(executor.executed().is_empty());
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::Cancelled)));
}

/// Splits every multi-word subject into two halves; classifies nothing confidently.
fn halving_oracle() -> FnOracle {
    FnOracle::new(|request| match request.task {
        OracleTask::Classify => Ok(classification_reply(Axes::CONSERVATIVE, false)),
        OracleTask::Decompose => {
            let words: Vec<&str> = request.subject.split_whitespace().collect();
            if words.len() < 2 {
                return Ok(decomposition_reply(&[]));
            }
            let (left, right) = words.split_at(words.len() / 2);
            Ok(decomposition_reply(&[&left.join(" "), &right.join(" ")]))
        }
    })
}

#[test]
fn depth_limit_forces_leaves() {
    let mut config = GateConfig::default();
    config.decomposition.max_depth = 1;
    let (gate, _) = gatekeeper_with(config, Arc::new(halving_oracle()));
    let result = gate
        .submit("show cpu load and memory usage", &SessionContext::new("s"))
        .expect("submit");

    assert_eq!(result.tree.len(), 3);
    assert_eq!(result.tree.max_depth(), 1);
    let forced = result
        .recovered
        .iter()
        .filter(|e| matches!(e, GateError::DecompositionBoundsExceeded { depth: 1, .. }))
        .count();
    assert_eq!(forced, 2);
    for id in result.tree.leaf_ids() {
        assert_eq!(result.tree.get(id).expect("leaf").axes(), Axes::CONSERVATIVE);
    }
    assert!(validate_invariants(&result.tree).is_empty());
}

#[test]
fn node_limit_forces_the_parent_to_stay_a_leaf() {
    let mut config = GateConfig::default();
    config.decomposition.max_nodes = 4;
    let oracle = FnOracle::new(|request| match request.task {
        OracleTask::Classify => Ok(classification_reply(Axes::CONSERVATIVE, false)),
        OracleTask::Decompose => Ok(decomposition_reply(&[
            "show cpu", "show memory", "show disk", "show swap", "show load",
        ])),
    });
    let (gate, _) = gatekeeper_with(config, Arc::new(oracle));
    let result = gate
        .submit(
            "show cpu memory disk swap and load figures",
            &SessionContext::new("s"),
        )
        .expect("submit");

    assert_eq!(result.tree.len(), 1);
    assert!(result.recovered.iter().any(|e| matches!(
        e,
        GateError::DecompositionBoundsExceeded { reason, .. } if reason.contains("node limit")
    )));
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::ForcedLeaf { .. })));
}

#[test]
fn approval_rate_limit_holds_the_next_confirmation() {
    let mut config = GateConfig::default();
    config.rate_limits.approval = RateLimit::new(1, 600);
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper_with(config, Arc::new(oracle));
    let session = confirming_session("s");

    let mut first = gate.submit("show memory usage", &session).expect("first");
    let mut second = gate.submit("show memory usage", &session).expect("second");
    let first_root = first.tree.root_id();
    let second_root = second.tree.root_id();

    let status = gate.confirm(&mut first, first_root, &session).expect("confirm");
    assert_eq!(status, OperationStatus::Complete);
    let status = gate
        .confirm(&mut second, second_root, &session)
        .expect("confirm");
    assert_eq!(status, OperationStatus::Held);

    let err = second.error_for(second_root).expect("held error");
    assert!(matches!(
        err,
        GateError::RateLimitExceeded {
            category: RateCategory::Approval,
            ..
        }
    ));
    assert!(err.is_resumable());
    assert_eq!(executor.executed().len(), 1);
}

#[test]
fn circuit_breaker_pauses_until_the_session_is_continued() {
    let mut config = GateConfig::default();
    config.circuit_breaker.max_operations = 1;
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper_with(config, Arc::new(oracle));
    let session = SessionContext::new("s");

    let first = gate.submit("show memory usage", &session).expect("first");
    assert_eq!(first.root_status(), OperationStatus::Complete);

    let mut second = gate.submit("show memory usage", &session).expect("second");
    let root = second.tree.root_id();
    assert_eq!(second.root_status(), OperationStatus::Held);
    assert!(matches!(
        second.error_for(root),
        Some(GateError::CircuitBreakerTripped {
            ceiling: Ceiling::Operations,
            ..
        })
    ));

    let status = gate.retry(&mut second, root, &session).expect("retry");
    assert_eq!(status, OperationStatus::Held);

    let budget = gate.continue_session("s").expect("session known");
    assert_eq!(budget.continuations, 1);
    let status = gate.retry(&mut second, root, &session).expect("retry");
    assert_eq!(status, OperationStatus::Complete);
    assert_eq!(executor.executed().len(), 2);
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::SessionPaused { .. })));
    assert!(has_event(&gate, |e| matches!(e, AuditEvent::SessionResumed)));
    gate.audit().verify_chain().expect("audit chain intact");
}

#[test]
fn correction_is_offered_to_the_next_classification() {
    let oracle = Arc::new(
        ScriptedOracle::new()
            .classify("show disk usage", read_axes(), true)
            .classify("show memory usage", read_axes(), true),
    );
    let (gate, _) = gatekeeper(oracle.clone());
    let first = gate
        .submit("show disk usage", &SessionContext::new("s"))
        .expect("first");
    let corrected = Axes::new(Destination::Stream, Consumer::Machine, Semantics::Read);
    gate.feedback()
        .record(
            first.tree.root_id(),
            FeedbackKind::Correction,
            Some(corrected),
            Some("output is piped".to_string()),
        )
        .expect("correction");

    gate.submit("show memory usage", &SessionContext::new("s"))
        .expect("second");
    let prompts = oracle.prompts_for(OracleTask::Classify);
    let last = prompts.last().expect("classify prompt");
    assert!(last.contains("\"show disk usage\""));
    assert!(last.contains("(corrected by user)"));
    assert!(has_event(&gate, |e| matches!(
        e,
        AuditEvent::Feedback {
            kind: FeedbackKind::Correction
        }
    )));
}

#[test]
fn oracle_errors_are_never_fatal() {
    let oracle = FnOracle::new(|_| Err(OracleError::Timeout(std::time::Duration::from_secs(1))));
    let (gate, _) = gatekeeper(Arc::new(oracle));
    let result = gate
        .submit("check logs and restart nginx", &SessionContext::new("s"))
        .expect("submit");

    assert_eq!(result.tree.root().children.len(), 2);
    assert!(
        result
            .recovered
            .iter()
            .all(|e| matches!(e, GateError::ClassificationUnavailable { .. }))
    );
    assert_eq!(result.recovered.len(), 3);
    assert!(validate_invariants(&result.tree).is_empty());
}

#[test]
fn declined_operation_is_user_rejected() {
    let oracle = ScriptedOracle::new().classify("show memory usage", read_axes(), true);
    let (gate, executor) = gatekeeper(Arc::new(oracle));
    let session = confirming_session("s");
    let mut result = gate.submit("show memory usage", &session).expect("submit");
    let root = result.tree.root_id();

    gate.decline(&mut result, root).expect("decline");
    assert_eq!(result.tree.root().failure, Some(FailureReason::UserRejected));
    assert!(result.error_for(root).is_none());
    assert!(matches!(
        gate.decline(&mut result, root),
        Err(GateError::InvalidState { action: "decline", .. })
    ));
    assert!(executor.executed().is_empty());
}
