//! Expression interpreter.
//!
//! Total and deterministic: every expression evaluates to a JSON value.
//! Missing variables, results, members and out-of-range indexes are `null`;
//! ordering comparisons between non-comparable values are `false`.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::ast::{BinaryOp, Expr};
use super::{Scope, is_truthy};

impl Expr {
    pub fn evaluate(&self, scope: &dyn Scope) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Variable(name) => scope.variable(name).cloned().unwrap_or(Value::Null),
            Self::Result(name) => scope.result(name).cloned().unwrap_or(Value::Null),
            Self::Member { target, field } => match target.evaluate(scope) {
                Value::Object(mut map) => map.remove(field).unwrap_or(Value::Null),
                _ => Value::Null,
            },
            Self::Index { target, index } => {
                let target = target.evaluate(scope);
                let index = index.evaluate(scope);
                index_value(target, &index)
            }
            Self::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(scope))),
            Self::Negate(inner) => match as_number(&inner.evaluate(scope)) {
                Some(n) => number_value(-n),
                None => Value::Null,
            },
            Self::Binary { op, left, right } => evaluate_binary(*op, left, right, scope),
            Self::Call { function, args } => {
                let values: Vec<Value> = args.iter().map(|a| a.evaluate(scope)).collect();
                function.apply(&values)
            }
        }
    }

    /// Evaluate and reduce to truthiness.
    pub fn evaluate_bool(&self, scope: &dyn Scope) -> bool {
        is_truthy(&self.evaluate(scope))
    }
}

fn evaluate_binary(op: BinaryOp, left: &Expr, right: &Expr, scope: &dyn Scope) -> Value {
    match op {
        BinaryOp::Or => Value::Bool(left.evaluate_bool(scope) || right.evaluate_bool(scope)),
        BinaryOp::And => Value::Bool(left.evaluate_bool(scope) && right.evaluate_bool(scope)),
        _ => {
            let l = left.evaluate(scope);
            let r = right.evaluate(scope);
            let result = match op {
                BinaryOp::Eq => loose_eq(&l, &r),
                BinaryOp::NotEq => !loose_eq(&l, &r),
                BinaryOp::Lt => compare(&l, &r) == Some(Ordering::Less),
                BinaryOp::Le => matches!(compare(&l, &r), Some(Ordering::Less | Ordering::Equal)),
                BinaryOp::Gt => compare(&l, &r) == Some(Ordering::Greater),
                BinaryOp::Ge => {
                    matches!(compare(&l, &r), Some(Ordering::Greater | Ordering::Equal))
                }
                BinaryOp::Or | BinaryOp::And => false,
            };
            Value::Bool(result)
        }
    }
}

fn index_value(target: Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(mut items), Value::Number(_)) => {
            let Some(i) = as_number(index) else {
                return Value::Null;
            };
            if i < 0.0 || i.fract() != 0.0 || i as usize >= items.len() {
                return Value::Null;
            }
            items.swap_remove(i as usize)
        }
        (Value::Object(mut map), Value::String(key)) => map.remove(key).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Numbers compare by value (`1 == 1.0`); everything else structurally.
pub(crate) fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Numbers order numerically, strings lexicographically; nothing else orders.
pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Whole numbers become JSON integers; NaN and infinities become `null`.
pub(crate) fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    // 2^53: beyond this f64 cannot represent every integer.
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::parse_expression;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapScope {
        variables: HashMap<String, Value>,
        results: HashMap<String, Value>,
    }

    impl Scope for MapScope {
        fn variable(&self, name: &str) -> Option<&Value> {
            self.variables.get(name)
        }
        fn result(&self, name: &str) -> Option<&Value> {
            self.results.get(name)
        }
    }

    fn scope() -> MapScope {
        let mut s = MapScope::default();
        s.variables.insert("Region".into(), json!("eu-west-1"));
        s.variables.insert("Threshold".into(), json!(10));
        s.variables.insert("Flags".into(), json!({ "beta": true }));
        s.results.insert(
            "FetchOrders".into(),
            json!({ "count": 12, "items": [{ "id": "A1" }, { "id": "B2" }] }),
        );
        s
    }

    fn eval(src: &str) -> Value {
        parse_expression(src).unwrap().evaluate(&scope())
    }

    #[test]
    fn test_variables_and_results() {
        assert_eq!(eval("Variables('Region')"), json!("eu-west-1"));
        assert_eq!(eval("Results('FetchOrders').count"), json!(12));
        assert_eq!(eval("Results('FetchOrders').items[1].id"), json!("B2"));
        assert_eq!(eval("Variables('Flags')['beta']"), json!(true));
    }

    #[test]
    fn test_missing_names_are_null() {
        assert_eq!(eval("Variables('Nope')"), Value::Null);
        assert_eq!(eval("Results('Later').count"), Value::Null);
        assert_eq!(eval("Results('FetchOrders').items[9]"), Value::Null);
        assert_eq!(eval("Results('FetchOrders').items[-1]"), Value::Null);
        assert_eq!(eval("Variables('Region').length"), Value::Null);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("Results('FetchOrders').count > Variables('Threshold')"), json!(true));
        assert_eq!(eval("Variables('Threshold') == 10.0"), json!(true));
        assert_eq!(eval("'b' >= 'a'"), json!(true));
        assert_eq!(eval("Variables('Missing') > 3"), json!(false));
        assert_eq!(eval("Variables('Missing') <= 3"), json!(false));
        assert_eq!(eval("Variables('Missing') == null"), json!(true));
        assert_eq!(eval("'10' == 10"), json!(false));
    }

    #[test]
    fn test_logic_short_circuit_and_truthiness() {
        assert_eq!(eval("Variables('Missing') && Variables('Region')"), json!(false));
        assert_eq!(eval("Variables('Missing') || Variables('Region')"), json!(true));
        assert_eq!(eval("!Variables('Missing')"), json!(true));
        assert_eq!(eval("!(1 < 2) || false"), json!(false));
    }

    #[test]
    fn test_negate_and_functions() {
        assert_eq!(eval("-Variables('Threshold')"), json!(-10));
        assert_eq!(eval("-'x'"), Value::Null);
        assert_eq!(eval("Add(Results('FetchOrders').count, 0.5)"), json!(12.5));
        assert_eq!(eval("ToUpper(Variables('Region'))"), json!("EU-WEST-1"));
        assert_eq!(eval("Length(Results('FetchOrders').items)"), json!(2));
        assert_eq!(eval("Divide(1, 0)"), Value::Null);
    }

    #[test]
    fn test_number_value_normalisation() {
        assert_eq!(number_value(3.0), json!(3));
        assert_eq!(number_value(-0.5), json!(-0.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
        assert_eq!(number_value(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let expr = parse_expression("Concat(Variables('Region'), '-', Results('FetchOrders').count)").unwrap();
        let s = scope();
        assert_eq!(expr.evaluate(&s), expr.evaluate(&s));
        assert_eq!(expr.evaluate(&s), json!("eu-west-1-12"));
    }
}
