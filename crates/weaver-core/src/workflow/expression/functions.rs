//! Built-in transformation functions.
//!
//! Arity is checked when the expression is parsed. At evaluation time every
//! function except the logic group returns `null` when any argument is `null`
//! or has the wrong type.

use serde_json::Value;

use super::eval::{as_number, loose_eq, number_value};
use super::{ExpressionError, is_truthy, to_text};

/// Callable functions. `Variables` and `Results` are parsed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    // String
    ToUpper,
    ToLower,
    Trim,
    Concat,
    Substring,
    Replace,
    Length,
    Contains,
    StartsWith,
    EndsWith,
    Split,
    Join,
    ToString,
    // Math
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Round,
    Floor,
    Ceiling,
    Abs,
    Min,
    Max,
    ToNumber,
    // Logic
    Not,
    If,
    Coalesce,
    IsNull,
    IsEmpty,
}

const ALL: [Function; 30] = [
    Function::ToUpper,
    Function::ToLower,
    Function::Trim,
    Function::Concat,
    Function::Substring,
    Function::Replace,
    Function::Length,
    Function::Contains,
    Function::StartsWith,
    Function::EndsWith,
    Function::Split,
    Function::Join,
    Function::ToString,
    Function::Add,
    Function::Subtract,
    Function::Multiply,
    Function::Divide,
    Function::Mod,
    Function::Round,
    Function::Floor,
    Function::Ceiling,
    Function::Abs,
    Function::Min,
    Function::Max,
    Function::ToNumber,
    Function::Not,
    Function::If,
    Function::Coalesce,
    Function::IsNull,
    Function::IsEmpty,
];

impl Function {
    pub fn name(self) -> &'static str {
        match self {
            Self::ToUpper => "ToUpper",
            Self::ToLower => "ToLower",
            Self::Trim => "Trim",
            Self::Concat => "Concat",
            Self::Substring => "Substring",
            Self::Replace => "Replace",
            Self::Length => "Length",
            Self::Contains => "Contains",
            Self::StartsWith => "StartsWith",
            Self::EndsWith => "EndsWith",
            Self::Split => "Split",
            Self::Join => "Join",
            Self::ToString => "ToString",
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::Mod => "Mod",
            Self::Round => "Round",
            Self::Floor => "Floor",
            Self::Ceiling => "Ceiling",
            Self::Abs => "Abs",
            Self::Min => "Min",
            Self::Max => "Max",
            Self::ToNumber => "ToNumber",
            Self::Not => "Not",
            Self::If => "If",
            Self::Coalesce => "Coalesce",
            Self::IsNull => "IsNull",
            Self::IsEmpty => "IsEmpty",
        }
    }

    /// Look up a function by its exact (case-sensitive) name.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL.into_iter().find(|f| f.name() == name)
    }

    /// `(min, max)` argument count; `None` max means variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::ToUpper
            | Self::ToLower
            | Self::Trim
            | Self::Length
            | Self::ToString
            | Self::Floor
            | Self::Ceiling
            | Self::Abs
            | Self::ToNumber
            | Self::Not
            | Self::IsNull
            | Self::IsEmpty => (1, Some(1)),
            Self::Contains
            | Self::StartsWith
            | Self::EndsWith
            | Self::Split
            | Self::Join
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Mod => (2, Some(2)),
            Self::Replace | Self::If => (3, Some(3)),
            Self::Substring => (2, Some(3)),
            Self::Round => (1, Some(2)),
            Self::Concat | Self::Min | Self::Max | Self::Coalesce => (1, None),
        }
    }

    pub fn check_arity(self, found: usize) -> Result<(), ExpressionError> {
        let (min, max) = self.arity();
        let ok = found >= min && max.is_none_or(|m| found <= m);
        if ok {
            return Ok(());
        }
        let expected = match max {
            Some(m) if m == min => min.to_string(),
            Some(m) => format!("{min} to {m}"),
            None => format!("at least {min}"),
        };
        Err(ExpressionError::Arity {
            function: self.name().to_string(),
            expected,
            found,
        })
    }

    /// Apply to already-evaluated arguments.
    pub fn apply(self, args: &[Value]) -> Value {
        match self {
            Self::Not => Value::Bool(!is_truthy(arg(args, 0))),
            Self::If => {
                if is_truthy(arg(args, 0)) {
                    arg(args, 1).clone()
                } else {
                    arg(args, 2).clone()
                }
            }
            Self::Coalesce => args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null),
            Self::IsNull => Value::Bool(arg(args, 0).is_null()),
            Self::IsEmpty => Value::Bool(match arg(args, 0) {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                Value::Bool(_) | Value::Number(_) => false,
            }),
            _ if args.iter().any(Value::is_null) => Value::Null,
            _ => self.apply_strict(args).unwrap_or(Value::Null),
        }
    }

    /// Functions that need non-null arguments of the right type.
    fn apply_strict(self, args: &[Value]) -> Option<Value> {
        let value = match self {
            Self::ToUpper => Value::String(arg(args, 0).as_str()?.to_uppercase()),
            Self::ToLower => Value::String(arg(args, 0).as_str()?.to_lowercase()),
            Self::Trim => Value::String(arg(args, 0).as_str()?.trim().to_string()),
            Self::Concat => Value::String(args.iter().map(to_text).collect()),
            Self::Substring => {
                let chars: Vec<char> = arg(args, 0).as_str()?.chars().collect();
                let start = non_negative(arg(args, 1))?;
                if start > chars.len() {
                    return Some(Value::String(String::new()));
                }
                let len = match args.get(2) {
                    Some(len) => non_negative(len)?,
                    None => chars.len() - start,
                };
                let end = start.saturating_add(len).min(chars.len());
                Value::String(chars[start..end].iter().collect())
            }
            Self::Replace => Value::String(
                arg(args, 0)
                    .as_str()?
                    .replace(arg(args, 1).as_str()?, arg(args, 2).as_str()?),
            ),
            Self::Length => {
                let len = match arg(args, 0) {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => return None,
                };
                Value::from(len)
            }
            Self::Contains => Value::Bool(match arg(args, 0) {
                Value::String(s) => s.contains(arg(args, 1).as_str()?),
                Value::Array(items) => items.iter().any(|v| loose_eq(v, arg(args, 1))),
                Value::Object(map) => map.contains_key(arg(args, 1).as_str()?),
                _ => return None,
            }),
            Self::StartsWith => Value::Bool(arg(args, 0).as_str()?.starts_with(arg(args, 1).as_str()?)),
            Self::EndsWith => Value::Bool(arg(args, 0).as_str()?.ends_with(arg(args, 1).as_str()?)),
            Self::Split => {
                let text = arg(args, 0).as_str()?;
                let sep = arg(args, 1).as_str()?;
                let parts: Vec<Value> = if sep.is_empty() {
                    text.chars().map(|c| Value::String(c.to_string())).collect()
                } else {
                    text.split(sep).map(|p| Value::String(p.to_string())).collect()
                };
                Value::Array(parts)
            }
            Self::Join => {
                let items = arg(args, 0).as_array()?;
                let sep = arg(args, 1).as_str()?;
                Value::String(items.iter().map(to_text).collect::<Vec<_>>().join(sep))
            }
            Self::ToString => Value::String(to_text(arg(args, 0))),
            Self::Add => number_value(num(arg(args, 0))? + num(arg(args, 1))?),
            Self::Subtract => number_value(num(arg(args, 0))? - num(arg(args, 1))?),
            Self::Multiply => number_value(num(arg(args, 0))? * num(arg(args, 1))?),
            Self::Divide => {
                let divisor = num(arg(args, 1))?;
                if divisor == 0.0 {
                    return None;
                }
                number_value(num(arg(args, 0))? / divisor)
            }
            Self::Mod => {
                let divisor = num(arg(args, 1))?;
                if divisor == 0.0 {
                    return None;
                }
                number_value(num(arg(args, 0))? % divisor)
            }
            Self::Round => {
                let n = num(arg(args, 0))?;
                let digits = match args.get(1) {
                    Some(d) => num(d)?.clamp(0.0, 15.0) as i32,
                    None => 0,
                };
                let factor = 10f64.powi(digits);
                number_value((n * factor).round() / factor)
            }
            Self::Floor => number_value(num(arg(args, 0))?.floor()),
            Self::Ceiling => number_value(num(arg(args, 0))?.ceil()),
            Self::Abs => number_value(num(arg(args, 0))?.abs()),
            Self::Min => number_value(numbers(args)?.into_iter().fold(f64::INFINITY, f64::min)),
            Self::Max => number_value(numbers(args)?.into_iter().fold(f64::NEG_INFINITY, f64::max)),
            Self::ToNumber => match arg(args, 0) {
                Value::Number(_) => arg(args, 0).clone(),
                Value::Bool(b) => Value::from(u8::from(*b)),
                Value::String(s) => number_value(s.trim().parse::<f64>().ok()?),
                _ => return None,
            },
            Self::Not | Self::If | Self::Coalesce | Self::IsNull | Self::IsEmpty => return None,
        };
        Some(value)
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Missing arguments read as `null`.
fn arg(args: &[Value], i: usize) -> &Value {
    static NULL: Value = Value::Null;
    args.get(i).unwrap_or(&NULL)
}

fn num(value: &Value) -> Option<f64> {
    as_number(value)
}

fn numbers(args: &[Value]) -> Option<Vec<f64>> {
    args.iter().map(as_number).collect()
}

fn non_negative(value: &Value) -> Option<usize> {
    let n = as_number(value)?;
    if n < 0.0 || n.fract() != 0.0 {
        return None;
    }
    Some(n as usize)
}
