//! Edge condition evaluation.
//!
//! Deterministic expressions are evaluated directly against the source
//! node's recorded result. Reasoning predicates cannot be answered here, so
//! evaluation is three-valued: it either decides the condition or names the
//! first predicate, in left-to-right short-circuit order, whose answer is
//! still unknown. The caller obtains that answer (and records it), then
//! evaluates again. Predicates are numbered in pre-order over the whole
//! condition tree, independent of which operands short-circuit, so a
//! recorded answer always refers to the same predicate.

use serde_json::Value;

use super::EdgeCondition;
use crate::record::{FailureKind, NodeOutcome};

/// The source-node result a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionInput<'a> {
    pub outcome: NodeOutcome,
    pub output: &'a Value,
    pub failure: Option<FailureKind>,
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation<'c> {
    /// The condition is decided.
    Decided(bool),
    /// Predicate number `index` must be answered before evaluation can continue.
    NeedsPredicate { index: u32, prompt: &'c str },
}

impl EdgeCondition {
    /// Evaluates the condition, consulting `answers` for predicates that
    /// were already answered in this run.
    pub fn evaluate<'c>(
        &'c self,
        input: &ConditionInput<'_>,
        answers: &dyn Fn(u32) -> Option<bool>,
    ) -> Evaluation<'c> {
        let mut next = 0;
        match eval(self, input, answers, &mut next) {
            Ok(value) => Evaluation::Decided(value),
            Err((index, prompt)) => Evaluation::NeedsPredicate { index, prompt },
        }
    }

    /// Number of reasoning predicates anywhere in the tree.
    pub fn predicate_count(&self) -> u32 {
        match self {
            Self::Expression(_) => 0,
            Self::Predicate(_) => 1,
            Self::All(parts) | Self::Any(parts) => parts.iter().map(Self::predicate_count).sum(),
            Self::Not(inner) => inner.predicate_count(),
        }
    }

    /// Checks every expression parses and every composite has operands.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Self::Expression(text) => Expression::parse(text).map(|_| ()),
            Self::Predicate(prompt) if prompt.trim().is_empty() => {
                Err("predicate prompt is empty".to_string())
            }
            Self::Predicate(_) => Ok(()),
            Self::All(parts) | Self::Any(parts) if parts.is_empty() => {
                Err("composite condition has no operands".to_string())
            }
            Self::All(parts) | Self::Any(parts) => parts.iter().try_for_each(Self::check),
            Self::Not(inner) => inner.check(),
        }
    }
}

type Pending<'c> = (u32, &'c str);

fn eval<'c>(
    condition: &'c EdgeCondition,
    input: &ConditionInput<'_>,
    answers: &dyn Fn(u32) -> Option<bool>,
    next: &mut u32,
) -> Result<bool, Pending<'c>> {
    match condition {
        EdgeCondition::Expression(text) => Ok(Expression::parse(text)
            .map(|e| e.matches(input))
            .unwrap_or(false)),
        EdgeCondition::Predicate(prompt) => {
            let index = *next;
            *next += 1;
            answers(index).ok_or((index, prompt.as_str()))
        }
        EdgeCondition::All(parts) => {
            for (i, part) in parts.iter().enumerate() {
                if !eval(part, input, answers, next)? {
                    *next += parts[i + 1..].iter().map(EdgeCondition::predicate_count).sum::<u32>();
                    return Ok(false);
                }
            }
            Ok(true)
        }
        EdgeCondition::Any(parts) => {
            for (i, part) in parts.iter().enumerate() {
                if eval(part, input, answers, next)? {
                    *next += parts[i + 1..].iter().map(EdgeCondition::predicate_count).sum::<u32>();
                    return Ok(true);
                }
            }
            Ok(false)
        }
        EdgeCondition::Not(inner) => eval(inner, input, answers, next).map(|v| !v),
    }
}

// ---------------------------------------------------------------------------
// Deterministic expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Key {
    Outcome,
    Failure,
    Output(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Contains,
}

/// A parsed `key OP "value"` expression.
///
/// Keys:
/// - `outcome` — `"success"` or `"failure"`
/// - `failure` — the failure kind (e.g. `"domain_service_error"`), absent on success
/// - `output.<path>` — a field of the node's structured output, dotted for nesting
///
/// Operators: `==`, `!=`, `contains`. A missing key makes every operator false.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Expression {
    key: Key,
    operator: Operator,
    value: String,
}

impl Expression {
    fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let (lhs, operator, rhs) = split_operator(text)
            .ok_or_else(|| format!("expression '{text}' has no operator (==, !=, contains)"))?;

        let rhs = rhs.trim();
        let value = rhs
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .ok_or_else(|| format!("expression '{text}': value must be a quoted string"))?;

        let key = match lhs.trim() {
            "outcome" => Key::Outcome,
            "failure" => Key::Failure,
            other => match other.strip_prefix("output.") {
                Some(path) if !path.is_empty() && path.split('.').all(|s| !s.is_empty()) => {
                    Key::Output(path.split('.').map(str::to_string).collect())
                }
                _ => return Err(format!("expression '{text}': unknown key '{other}'")),
            },
        };

        Ok(Self {
            key,
            operator,
            value: value.to_string(),
        })
    }

    fn matches(&self, input: &ConditionInput<'_>) -> bool {
        let Some(actual) = self.resolve(input) else {
            return false;
        };
        match self.operator {
            Operator::Equals => actual == self.value,
            Operator::NotEquals => actual != self.value,
            Operator::Contains => actual.contains(&self.value),
        }
    }

    fn resolve(&self, input: &ConditionInput<'_>) -> Option<String> {
        match &self.key {
            Key::Outcome => Some(input.outcome.as_str().to_string()),
            Key::Failure => input.failure.map(|f| f.as_str().to_string()),
            Key::Output(path) => {
                let mut current = input.output;
                for segment in path {
                    current = current.get(segment)?;
                }
                match current {
                    Value::String(s) => Some(s.clone()),
                    Value::Bool(_) | Value::Number(_) => Some(current.to_string()),
                    _ => None,
                }
            }
        }
    }
}

const OPERATORS: [(&str, Operator); 3] = [
    (" contains ", Operator::Contains),
    ("!=", Operator::NotEquals),
    ("==", Operator::Equals),
];

/// Splits at the leftmost operator outside a quoted literal.
fn split_operator(text: &str) -> Option<(&str, Operator, &str)> {
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        if c == '"' {
            quoted = !quoted;
            continue;
        }
        if quoted {
            continue;
        }
        let rest = &text[i..];
        for (token, operator) in OPERATORS {
            if let Some(rhs) = rest.strip_prefix(token) {
                return Some((&text[..i], operator, rhs));
            }
        }
    }
    None
}
