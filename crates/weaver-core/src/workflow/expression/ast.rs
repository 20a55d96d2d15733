//! Expression syntax tree.

use serde_json::Value;

use super::References;
use super::functions::Function;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `Variables('name')`
    Variable(String),
    /// `Results('TaskName')`
    Result(String),
    /// `target.field`
    Member { target: Box<Expr>, field: String },
    /// `target[index]`
    Index { target: Box<Expr>, index: Box<Expr> },
    /// `!operand`
    Not(Box<Expr>),
    /// `-operand`
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call { function: Function, args: Vec<Expr> },
}

/// Binary operators, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        };
        f.write_str(s)
    }
}

impl Expr {
    /// The literal `true`, used to mark default branches.
    pub fn is_literal_true(&self) -> bool {
        matches!(self, Self::Literal(Value::Bool(true)))
    }

    /// Collect every variable and result name this expression reads.
    pub fn references(&self) -> References {
        let mut refs = References::default();
        self.collect(&mut refs);
        refs
    }

    fn collect(&self, refs: &mut References) {
        match self {
            Self::Literal(_) => {}
            Self::Variable(name) => {
                refs.variables.insert(name.clone());
            }
            Self::Result(name) => {
                refs.results.insert(name.clone());
            }
            Self::Member { target, .. } => target.collect(refs),
            Self::Index { target, index } => {
                target.collect(refs);
                index.collect(refs);
            }
            Self::Not(inner) | Self::Negate(inner) => inner.collect(refs),
            Self::Binary { left, right, .. } => {
                left.collect(refs);
                right.collect(refs);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.collect(refs);
                }
            }
        }
    }
}
