//! Conditional-branch selection.
//!
//! Branches route a completed task to at most one of its targets. The branch
//! whose expression is the literal `true` is the default. More than one truthy
//! non-default branch is reported as ambiguous rather than resolved by order.

use weaver_types::workflow::ConditionalBranch;

use super::expression::{Expr, ExpressionError, Scope, parse_condition};

/// A branch with its expression compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBranch {
    pub expression: Expr,
    pub target: String,
    pub is_default: bool,
}

impl CompiledBranch {
    pub fn compile(branch: &ConditionalBranch) -> Result<Self, ExpressionError> {
        let expression = parse_condition(&branch.expression)?;
        let is_default = expression.is_literal_true();
        Ok(Self {
            expression,
            target: branch.task_name.clone(),
            is_default,
        })
    }
}

/// Outcome of evaluating a task's branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSelection {
    /// Exactly one non-default branch matched.
    Selected(String),
    /// Nothing matched; the default branch applies.
    Default(String),
    /// Nothing matched and there is no default.
    NoMatch,
    /// Several non-default branches matched.
    Ambiguous(Vec<String>),
}

impl BranchSelection {
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Selected(t) | Self::Default(t) => Some(t),
            Self::NoMatch | Self::Ambiguous(_) => None,
        }
    }
}

/// Evaluate non-default branches in declaration order.
pub fn select_branch(branches: &[CompiledBranch], scope: &dyn Scope) -> BranchSelection {
    let matched: Vec<String> = branches
        .iter()
        .filter(|b| !b.is_default)
        .filter(|b| b.expression.evaluate_bool(scope))
        .map(|b| b.target.clone())
        .collect();

    match matched.len() {
        0 => branches
            .iter()
            .find(|b| b.is_default)
            .map(|b| BranchSelection::Default(b.target.clone()))
            .unwrap_or(BranchSelection::NoMatch),
        1 => BranchSelection::Selected(matched.into_iter().next().unwrap_or_default()),
        _ => BranchSelection::Ambiguous(matched),
    }
}

/// Whether the raw expression text denotes a default branch.
pub fn is_default_expression(expression: &str) -> bool {
    parse_condition(expression).is_ok_and(|e| e.is_literal_true())
}
