//! Structural invariants of an operation tree.

use std::collections::HashSet;

use crate::core::tree::{MAX_CHILDREN, MIN_CHILDREN, OperationTree};
use crate::core::types::{OperationStatus, PassKind};

/// Check tree invariants, returning stable error messages (empty when valid):
/// - every node is a leaf or has 2-5 children
/// - parents never carry execution state
/// - parent/child links agree and depths increase by one
/// - children of a decomposed node are recorded with a `decomposed` pass
pub fn validate_invariants(tree: &OperationTree) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for op in tree.iter() {
        if !seen.insert(op.id) {
            errors.push(format!("duplicate id {}", op.id));
        }

        match op.parent {
            Some(parent) => match tree.get(parent) {
                Some(p) => {
                    if !p.children.contains(&op.id) {
                        errors.push(format!("{}: parent {} does not list it", op.id, parent));
                    }
                    if op.depth != p.depth + 1 {
                        errors.push(format!(
                            "{}: depth {} under parent depth {}",
                            op.id, op.depth, p.depth
                        ));
                    }
                }
                None => errors.push(format!("{}: dangling parent {}", op.id, parent)),
            },
            None => {
                if op.id != tree.root_id() {
                    errors.push(format!("{}: orphan without parent", op.id));
                }
            }
        }

        if op.is_leaf() {
            continue;
        }

        if !(MIN_CHILDREN..=MAX_CHILDREN).contains(&op.children.len()) {
            errors.push(format!(
                "{}: {} children (expected {}-{})",
                op.id,
                op.children.len(),
                MIN_CHILDREN,
                MAX_CHILDREN
            ));
        }
        if op.execution.is_some() || op.status == OperationStatus::Executing {
            errors.push(format!("{}: decomposed operation was executed", op.id));
        }
        if !op.passes.iter().any(|p| p.kind == PassKind::Decomposed) {
            errors.push(format!("{}: missing decomposed pass", op.id));
        }
        for child in &op.children {
            if tree.get(*child).is_none() {
                errors.push(format!("{}: dangling child {}", op.id, child));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Axes, ClassificationPass};

    fn marker() -> ClassificationPass {
        ClassificationPass {
            pass_number: 0,
            kind: PassKind::Decomposed,
            indicators: Vec::new(),
            axes: Axes::CONSERVATIVE,
            confident: false,
            rationale: "decomposed".to_string(),
            degraded: None,
        }
    }

    #[test]
    fn single_leaf_is_valid() {
        assert!(validate_invariants(&OperationTree::new("show memory usage")).is_empty());
    }

    #[test]
    fn decomposed_tree_is_valid() {
        let mut tree = OperationTree::new("a and b");
        let root = tree.root_id();
        tree.add_children(root, vec!["a".to_string(), "b".to_string()])
            .expect("children");
        tree.push_pass(root, marker()).expect("pass");
        assert_eq!(validate_invariants(&tree), Vec::<String>::new());
    }

    #[test]
    fn missing_marker_is_reported() {
        let mut tree = OperationTree::new("a and b");
        let root = tree.root_id();
        tree.add_children(root, vec!["a".to_string(), "b".to_string()])
            .expect("children");
        let errors = validate_invariants(&tree);
        assert_eq!(errors, vec![format!("{root}: missing decomposed pass")]);
    }
}
