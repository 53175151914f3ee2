//! Structured predicates over JSON payloads
//!
//! Constraints such as `risk_level > 7` are represented as data
//! (`{field, op, value}` combined with `all` / `any` / `not`) and evaluated by
//! a small interpreter. Nothing here executes caller-provided code.

use crate::error::{HiveError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Field value is one of the listed values
    In,
    /// Field (string or array) contains the value
    Contains,
    /// Field is present and not null
    Exists,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::In => "in",
            CompareOp::Contains => "contains",
            CompareOp::Exists => "exists",
        }
    }
}

/// A single `{field, op, value}` comparison. `field` is a dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    fn evaluate(&self, subject: &Value) -> bool {
        let Some(actual) = lookup(subject, &self.field) else {
            return false;
        };

        match self.op {
            CompareOp::Exists => !actual.is_null(),
            CompareOp::Eq => values_equal(actual, &self.value),
            CompareOp::Ne => !values_equal(actual, &self.value),
            CompareOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            CompareOp::Le => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
                _ => false,
            },
            CompareOp::Contains => match actual {
                Value::Array(items) => items.iter().any(|i| values_equal(i, &self.value)),
                Value::String(s) => self.value.as_str().map(|v| s.contains(v)).unwrap_or(false),
                _ => false,
            },
        }
    }
}

/// Predicate tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    All { all: Vec<Predicate> },
    Any { any: Vec<Predicate> },
    Not { not: Box<Predicate> },
    Condition(Condition),
}

impl Predicate {
    pub fn condition(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Condition(Condition::new(field, op, value))
    }

    pub fn all(predicates: Vec<Predicate>) -> Self {
        Predicate::All { all: predicates }
    }

    pub fn any(predicates: Vec<Predicate>) -> Self {
        Predicate::Any { any: predicates }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not {
            not: Box::new(predicate),
        }
    }

    /// Evaluate against a JSON document. Missing fields never match.
    pub fn evaluate(&self, subject: &Value) -> bool {
        match self {
            Predicate::All { all } => all.iter().all(|p| p.evaluate(subject)),
            Predicate::Any { any } => any.iter().any(|p| p.evaluate(subject)),
            Predicate::Not { not } => !not.evaluate(subject),
            Predicate::Condition(c) => c.evaluate(subject),
        }
    }

    /// Parse the textual form `field op literal`, joined by `&&` and `||`
    /// (`&&` binds tighter, no parentheses).
    ///
    /// Literals: numbers, `true`/`false`/`null`, quoted strings, or bare words
    /// (taken as strings).
    pub fn parse(expression: &str) -> Result<Self> {
        let disjuncts = expression
            .split("||")
            .map(|part| {
                let conjuncts = part
                    .split("&&")
                    .map(parse_comparison)
                    .collect::<Result<Vec<_>>>()?;
                Ok(collapse(conjuncts, Predicate::all))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(collapse(disjuncts, Predicate::any))
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join = |f: &mut std::fmt::Formatter<'_>, items: &[Predicate], sep: &str| {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {sep} ")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, ")")
        };
        match self {
            Predicate::All { all } => join(f, all, "&&"),
            Predicate::Any { any } => join(f, any, "||"),
            Predicate::Not { not } => write!(f, "!{not}"),
            Predicate::Condition(c) => write!(f, "{} {} {}", c.field, c.op.symbol(), c.value),
        }
    }
}

fn collapse(mut items: Vec<Predicate>, combine: fn(Vec<Predicate>) -> Predicate) -> Predicate {
    if items.len() == 1 {
        items.remove(0)
    } else {
        combine(items)
    }
}

fn parse_comparison(text: &str) -> Result<Predicate> {
    let text = text.trim();
    // Two-character operators first so ">=" is not read as ">"
    const OPERATORS: [(&str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];

    for (symbol, op) in OPERATORS {
        if let Some(idx) = text.find(symbol) {
            let field = text[..idx].trim();
            let literal = text[idx + symbol.len()..].trim();
            if field.is_empty() || literal.is_empty() || !is_field_path(field) {
                return Err(HiveError::Validation(format!(
                    "malformed comparison '{text}'"
                )));
            }
            return Ok(Predicate::condition(field, op, parse_literal(literal)));
        }
    }

    Err(HiveError::Validation(format!(
        "no comparison operator in '{text}'"
    )))
}

fn is_field_path(field: &str) -> bool {
    field
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_literal(literal: &str) -> Value {
    let quoted = (literal.starts_with('"') && literal.ends_with('"'))
        || (literal.starts_with('\'') && literal.ends_with('\''));
    if quoted && literal.len() >= 2 {
        return Value::String(literal[1..literal.len() - 1].to_string());
    }
    match literal {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => literal
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(literal.to_string())),
    }
}

fn lookup<'a>(subject: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(subject, |current, key| current.get(key))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}
