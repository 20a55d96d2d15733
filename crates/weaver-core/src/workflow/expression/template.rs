//! `$[ ... ]` templates embedded in strings and JSON values.
//!
//! A string made of exactly one region renders to the raw value (type
//! preserving); anything else renders to text. `$$[` is a literal `$[`.

use serde_json::{Map, Value};

use super::ast::Expr;
use super::parser::parse_expression;
use super::{ExpressionError, References, Scope, to_text};

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expr),
}

/// A string with zero or more expression regions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Scan `input` for regions and compile each one.
    ///
    /// Brackets inside a region nest, and brackets inside quoted strings are
    /// ignored, so `$[Results('A').items[0]]` and `$[Concat(']', 'x')]` work.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let chars: Vec<char> = input.chars().collect();
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] == '$' && chars.get(i + 1) == Some(&'$') && chars.get(i + 2) == Some(&'[') {
                text.push_str("$[");
                i += 3;
                continue;
            }
            if chars[i] == '$' && chars.get(i + 1) == Some(&'[') {
                let start = i + 2;
                let end = find_region_end(&chars, start)?;
                let source: String = chars[start..end].iter().collect();
                let expr = parse_expression(&source).map_err(|e| e.offset(start))?;
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Expr(expr));
                i = end + 1;
                continue;
            }
            text.push(chars[i]);
            i += 1;
        }

        if !text.is_empty() || segments.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Self { segments })
    }

    pub fn has_expressions(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Expr(_)))
    }

    /// The expression when the template is exactly one region.
    pub fn as_single_expression(&self) -> Option<&Expr> {
        match self.segments.as_slice() {
            [Segment::Expr(expr)] => Some(expr),
            _ => None,
        }
    }

    pub fn render(&self, scope: &dyn Scope) -> Value {
        if let Some(expr) = self.as_single_expression() {
            return expr.evaluate(scope);
        }
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(expr) => out.push_str(&to_text(&expr.evaluate(scope))),
            }
        }
        Value::String(out)
    }

    pub fn references(&self) -> References {
        let mut refs = References::default();
        for segment in &self.segments {
            if let Segment::Expr(expr) = segment {
                refs.extend(expr.references());
            }
        }
        refs
    }
}

/// Index of the `]` closing a region whose body starts at `start`.
fn find_region_end(chars: &[char], start: usize) -> Result<usize, ExpressionError> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' => depth += 1,
                ']' if depth == 0 => return Ok(i),
                ']' => depth -= 1,
                _ => {}
            },
        }
        i += 1;
    }

    Err(ExpressionError::syntax(
        start.saturating_sub(2),
        "unterminated '$[' region",
    ))
}

/// Whether `input` contains at least one unescaped region.
pub fn contains_template(input: &str) -> bool {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i + 1 < chars.len() {
        if chars[i] == '$' && chars[i + 1] == '$' {
            i += 2;
            continue;
        }
        if chars[i] == '$' && chars[i + 1] == '[' {
            return true;
        }
        i += 1;
    }
    false
}

/// Parse a condition or branch expression: a bare expression or a single region.
pub fn parse_condition(input: &str) -> Result<Expr, ExpressionError> {
    let trimmed = input.trim();
    if trimmed.starts_with("$[") {
        let template = Template::parse(trimmed)?;
        if let Some(expr) = template.as_single_expression() {
            return Ok(expr.clone());
        }
        return Err(ExpressionError::syntax(
            0,
            "a condition must be a bare expression or exactly one '$[...]' region",
        ));
    }
    parse_expression(trimmed)
}

// ---------------------------------------------------------------------------
// ValueTemplate
// ---------------------------------------------------------------------------

/// A JSON value whose strings may carry templates.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTemplate {
    /// No templates anywhere below this point.
    Static(Value),
    Text(Template),
    Array(Vec<ValueTemplate>),
    Object(Vec<(String, ValueTemplate)>),
}

impl ValueTemplate {
    pub fn compile(value: &Value) -> Result<Self, ExpressionError> {
        let compiled = match value {
            Value::String(s) => {
                let template = Template::parse(s)?;
                if template.has_expressions() {
                    Self::Text(template)
                } else {
                    // Unescape `$$[` even when nothing else is dynamic.
                    Self::Static(template.render(&NoScope))
                }
            }
            Value::Array(items) => {
                let items = items.iter().map(Self::compile).collect::<Result<Vec<_>, _>>()?;
                if items.iter().all(|i| matches!(i, Self::Static(_))) {
                    Self::Static(Value::Array(items.into_iter().map(Self::into_static).collect()))
                } else {
                    Self::Array(items)
                }
            }
            Value::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
                    .collect::<Result<Vec<_>, ExpressionError>>()?;
                if entries.iter().all(|(_, v)| matches!(v, Self::Static(_))) {
                    Self::Static(Value::Object(
                        entries.into_iter().map(|(k, v)| (k, v.into_static())).collect(),
                    ))
                } else {
                    Self::Object(entries)
                }
            }
            other => Self::Static(other.clone()),
        };
        Ok(compiled)
    }

    fn into_static(self) -> Value {
        match self {
            Self::Static(v) => v,
            _ => Value::Null,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }

    pub fn render(&self, scope: &dyn Scope) -> Value {
        match self {
            Self::Static(v) => v.clone(),
            Self::Text(t) => t.render(scope),
            Self::Array(items) => Value::Array(items.iter().map(|i| i.render(scope)).collect()),
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.render(scope)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    pub fn references(&self) -> References {
        let mut refs = References::default();
        match self {
            Self::Static(_) => {}
            Self::Text(t) => refs.extend(t.references()),
            Self::Array(items) => {
                for item in items {
                    refs.extend(item.references());
                }
            }
            Self::Object(entries) => {
                for (_, v) in entries {
                    refs.extend(v.references());
                }
            }
        }
        refs
    }
}

/// Whether any string anywhere inside `value` contains a region.
pub fn value_contains_template(value: &Value) -> bool {
    match value {
        Value::String(s) => contains_template(s),
        Value::Array(items) => items.iter().any(value_contains_template),
        Value::Object(map) => map.values().any(value_contains_template),
        _ => false,
    }
}

struct NoScope;

impl Scope for NoScope {
    fn variable(&self, _name: &str) -> Option<&Value> {
        None
    }
    fn result(&self, _name: &str) -> Option<&Value> {
        None
    }
}
