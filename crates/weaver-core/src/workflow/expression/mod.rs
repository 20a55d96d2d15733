//! Expression and template language.
//!
//! `$[ ... ]` regions embed expressions in parameter strings; conditions and
//! branch expressions are bare expressions. Source text goes through
//! `lexer` -> `parser` -> `ast::Expr`, which `eval` interprets against a
//! `Scope`. Evaluation is total: missing names, members and indexes yield
//! `null` rather than errors.
//!
//! ```text
//! $[Variables('Region')]
//! Results('FetchOrders').count > Variables('Threshold') && !IsEmpty(Results('FetchOrders').items)
//! ```

pub mod ast;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod template;

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;

pub use ast::{BinaryOp, Expr};
pub use functions::Function;
pub use parser::parse_expression;
pub use template::{Template, ValueTemplate, parse_condition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Compile-time expression failures. Evaluation itself never fails.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{function}' expects {expected} argument(s), found {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },

    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

impl ExpressionError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    /// Shift reported positions when the expression sits inside a larger string.
    pub(crate) fn offset(self, by: usize) -> Self {
        match self {
            Self::Syntax { position, message } => Self::Syntax {
                position: position + by,
                message,
            },
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Names an expression can read.
pub trait Scope {
    /// `Variables('name')`
    fn variable(&self, name: &str) -> Option<&Value>;
    /// `Results('name')`
    fn result(&self, name: &str) -> Option<&Value>;
}

/// Variable and result names an expression reads, for load-time checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pub variables: BTreeSet<String>,
    pub results: BTreeSet<String>,
}

impl References {
    pub fn extend(&mut self, other: References) {
        self.variables.extend(other.variables);
        self.results.extend(other.results);
    }
}

/// Truthiness: `null`, `false`, `0` and `""` are falsy, everything else truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value into template text. `null` renders empty, containers as compact JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
