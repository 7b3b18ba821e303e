//! Operation arena.
//!
//! Operations live in a map keyed by id and refer to each other by id only.
//! Cycles are impossible: children always receive fresh ids that are checked
//! against the parent's ancestry before insertion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::confidence::ExecutionTier;
use crate::core::examples::effective_pass;
use crate::core::types::{
    Axes, ClassificationPass, ExecutionReport, FailureReason, HoldReason, OperationId,
    OperationStatus, VerificationResult,
};

pub const MIN_CHILDREN: usize = 2;
pub const MAX_CHILDREN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
    #[error("decomposition must produce 2-5 children, got {0}")]
    ChildCount(usize),
    #[error("operation {0} already has children")]
    AlreadyDecomposed(OperationId),
    #[error("operation {id} is {status}; cannot decompose")]
    NotDecomposable {
        id: OperationId,
        status: OperationStatus,
    },
    #[error("child id {0} collides with an existing operation or ancestor")]
    IdCollision(OperationId),
    #[error("operation {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("operation {0} has children and cannot execute")]
    ParentExecution(OperationId),
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicOperation {
    pub id: OperationId,
    /// Original request text for this node.
    pub request: String,
    /// Realized content handed to the executor. Starts equal to `request`.
    pub content: String,
    pub parent: Option<OperationId>,
    pub children: Vec<OperationId>,
    pub depth: u32,
    pub status: OperationStatus,
    /// Number of status transitions so far; used as a persistence sequence.
    pub transitions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<HoldReason>,
    /// Prompt-injection signatures found by the sanitizer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injection_signatures: Vec<String>,
    pub passes: Vec<ClassificationPass>,
    pub verifications: Vec<VerificationResult>,
    /// Verification attempt counter; results are write-once per attempt.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ExecutionTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
    pub created_at: DateTime<Utc>,
}

impl AtomicOperation {
    fn new(request: String, parent: Option<OperationId>, depth: u32) -> Self {
        Self {
            id: OperationId::new(),
            content: request.clone(),
            request,
            parent,
            children: Vec::new(),
            depth,
            status: OperationStatus::Classifying,
            transitions: 0,
            failure: None,
            hold: None,
            injection_signatures: Vec::new(),
            passes: Vec::new(),
            verifications: Vec::new(),
            attempt: 0,
            confidence: None,
            tier: None,
            execution: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The pass the operation is acted on.
    pub fn current_pass(&self) -> Option<&ClassificationPass> {
        effective_pass(&self.passes)
    }

    pub fn axes(&self) -> Axes {
        self.current_pass()
            .map_or(Axes::CONSERVATIVE, |p| p.axes)
    }

    pub fn is_confident(&self) -> bool {
        self.current_pass().is_some_and(|p| p.confident)
    }

    /// Results of the latest verification attempt, in layer order.
    pub fn latest_results(&self) -> Vec<&VerificationResult> {
        self.verifications
            .iter()
            .filter(|r| r.attempt == self.attempt)
            .collect()
    }

    pub fn next_pass_number(&self) -> u32 {
        self.passes.last().map_or(1, |p| p.pass_number + 1)
    }
}

/// Decomposition tree rooted at the submitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTree {
    root: OperationId,
    nodes: BTreeMap<OperationId, AtomicOperation>,
    order: Vec<OperationId>,
}

impl OperationTree {
    pub fn new(request: impl Into<String>) -> Self {
        let root = AtomicOperation::new(request.into(), None, 0);
        let id = root.id;
        Self {
            root: id,
            nodes: BTreeMap::from([(id, root)]),
            order: vec![id],
        }
    }

    pub fn root_id(&self) -> OperationId {
        self.root
    }

    pub fn root(&self) -> &AtomicOperation {
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: OperationId) -> Option<&AtomicOperation> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: OperationId) -> Result<&mut AtomicOperation, TreeError> {
        self.nodes
            .get_mut(&id)
            .ok_or(TreeError::UnknownOperation(id))
    }

    pub fn require(&self, id: OperationId) -> Result<&AtomicOperation, TreeError> {
        self.get(id).ok_or(TreeError::UnknownOperation(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Operations in insertion order (root first, then breadth of each decomposition).
    pub fn iter(&self) -> impl Iterator<Item = &AtomicOperation> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn leaf_ids(&self) -> Vec<OperationId> {
        self.iter().filter(|op| op.is_leaf()).map(|op| op.id).collect()
    }

    pub fn max_depth(&self) -> u32 {
        self.iter().map(|op| op.depth).max().unwrap_or(0)
    }

    /// Ancestor ids, nearest first.
    pub fn ancestors(&self, id: OperationId) -> Vec<OperationId> {
        let mut out = Vec::new();
        let mut cursor = self.get(id).and_then(|op| op.parent);
        while let Some(parent) = cursor {
            if out.contains(&parent) {
                break;
            }
            out.push(parent);
            cursor = self.get(parent).and_then(|op| op.parent);
        }
        out
    }

    /// Attach 2-5 children to a childless, non-terminal leaf.
    pub fn add_children(
        &mut self,
        parent: OperationId,
        requests: Vec<String>,
    ) -> Result<Vec<OperationId>, TreeError> {
        if !(MIN_CHILDREN..=MAX_CHILDREN).contains(&requests.len()) {
            return Err(TreeError::ChildCount(requests.len()));
        }
        let parent_op = self.require(parent)?;
        if !parent_op.children.is_empty() {
            return Err(TreeError::AlreadyDecomposed(parent));
        }
        if parent_op.status != OperationStatus::Classifying {
            return Err(TreeError::NotDecomposable {
                id: parent,
                status: parent_op.status,
            });
        }
        let depth = parent_op.depth + 1;
        let mut lineage = self.ancestors(parent);
        lineage.push(parent);

        let children: Vec<AtomicOperation> = requests
            .into_iter()
            .map(|request| AtomicOperation::new(request, Some(parent), depth))
            .collect();
        for child in &children {
            if lineage.contains(&child.id) || self.nodes.contains_key(&child.id) {
                return Err(TreeError::IdCollision(child.id));
            }
        }

        let ids: Vec<OperationId> = children.iter().map(|c| c.id).collect();
        for child in children {
            self.order.push(child.id);
            self.nodes.insert(child.id, child);
        }
        self.get_mut(parent)?.children = ids.clone();
        Ok(ids)
    }

    pub(crate) fn push_pass(
        &mut self,
        id: OperationId,
        mut pass: ClassificationPass,
    ) -> Result<ClassificationPass, TreeError> {
        let op = self.get_mut(id)?;
        pass.pass_number = op.next_pass_number();
        op.passes.push(pass.clone());
        Ok(pass)
    }

    /// Validated status change. Returns the new transition sequence number.
    pub(crate) fn transition(
        &mut self,
        id: OperationId,
        to: OperationStatus,
    ) -> Result<u32, TreeError> {
        let op = self.get_mut(id)?;
        if to == OperationStatus::Executing && !op.children.is_empty() {
            return Err(TreeError::ParentExecution(id));
        }
        if !op.status.can_transition_to(to) {
            return Err(TreeError::InvalidTransition {
                id,
                from: op.status,
                to,
            });
        }
        op.status = to;
        op.transitions += 1;
        if to != OperationStatus::Held {
            op.hold = None;
        }
        Ok(op.transitions)
    }

    pub(crate) fn fail(
        &mut self,
        id: OperationId,
        reason: FailureReason,
    ) -> Result<u32, TreeError> {
        let seq = self.transition(id, OperationStatus::Failed)?;
        self.get_mut(id)?.failure = Some(reason);
        Ok(seq)
    }

    pub(crate) fn hold(&mut self, id: OperationId, reason: HoldReason) -> Result<u32, TreeError> {
        let seq = self.transition(id, OperationStatus::Held)?;
        self.get_mut(id)?.hold = Some(reason);
        Ok(seq)
    }

    /// Resolve decomposed ancestors whose children are all terminal.
    ///
    /// Returns `(id, new status, sequence)` for each ancestor that changed.
    pub(crate) fn refresh_ancestors(
        &mut self,
        id: OperationId,
    ) -> Result<Vec<(OperationId, OperationStatus, u32)>, TreeError> {
        let mut changed = Vec::new();
        for ancestor in self.ancestors(id) {
            let op = self.require(ancestor)?;
            if op.status != OperationStatus::Decomposed {
                continue;
            }
            let statuses: Vec<OperationStatus> = op
                .children
                .iter()
                .filter_map(|c| self.get(*c).map(|child| child.status))
                .collect();
            if !statuses.iter().all(|s| s.is_terminal()) {
                break;
            }
            let seq = if statuses.iter().all(|s| *s == OperationStatus::Complete) {
                self.transition(ancestor, OperationStatus::Complete)?
            } else {
                self.fail(ancestor, FailureReason::ChildFailed)?
            };
            changed.push((ancestor, self.require(ancestor)?.status, seq));
        }
        Ok(changed)
    }
}
