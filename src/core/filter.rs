//! Message filters.
//!
//! Filter expressions are conjunctions of comparisons:
//!
//! ```text
//! color = 'red' AND size >= 3 AND relay.priority > 4
//! ```
//!
//! Identifiers resolve to message properties, except the `relay.*`
//! headers (`relay.id`, `relay.address`, `relay.priority`,
//! `relay.durable`, `relay.timestamp`). A comparison against a missing
//! property is false.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::core::error::{BrokerError, Result};
use crate::core::message::{PropertyValue, ServerMessage};

pub trait Filter: Send + Sync + fmt::Debug {
    fn matches(&self, message: &ServerMessage) -> bool;

    /// Source text, if the filter was parsed from one.
    fn expression(&self) -> Option<&str> {
        None
    }
}

/// Parses `expression`, treating empty or blank input as "no filter".
pub fn parse_filter(expression: Option<&str>) -> Result<Option<Arc<dyn Filter>>> {
    match expression.map(str::trim) {
        None | Some("") => Ok(None),
        Some(expr) => Ok(Some(Arc::new(ExpressionFilter::parse(expr)?))),
    }
}

/// Adapts a closure into a [`Filter`].
pub struct FnFilter<F>(pub F);

impl<F> fmt::Debug for FnFilter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnFilter")
    }
}

impl<F> Filter for FnFilter<F>
where
    F: Fn(&ServerMessage) -> bool + Send + Sync,
{
    fn matches(&self, message: &ServerMessage) -> bool {
        (self.0)(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone)]
struct Comparison {
    identifier: String,
    op: Op,
    literal: Literal,
}

#[derive(Debug, Clone)]
pub struct ExpressionFilter {
    expression: String,
    terms: Vec<Comparison>,
}

impl ExpressionFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| BrokerError::InvalidFilter {
            expression: expression.to_string(),
            reason,
        };

        let tokens = tokenize(expression).map_err(invalid)?;
        let mut terms = Vec::new();
        let mut iter = tokens.into_iter().peekable();

        loop {
            let identifier = match iter.next() {
                Some(Token::Word(w)) => w,
                other => return Err(invalid(format!("expected identifier, found {other:?}"))),
            };
            let op = match iter.next() {
                Some(Token::Op(op)) => op,
                other => return Err(invalid(format!("expected operator, found {other:?}"))),
            };
            let literal = match iter.next() {
                Some(Token::Str(s)) => Literal::Str(s),
                Some(Token::Word(w)) => parse_word_literal(&w)
                    .ok_or_else(|| invalid(format!("unsupported literal {w:?}")))?,
                other => return Err(invalid(format!("expected literal, found {other:?}"))),
            };
            if matches!(literal, Literal::Bool(_)) && !matches!(op, Op::Eq | Op::Ne) {
                return Err(invalid("booleans only support = and <>".to_string()));
            }
            terms.push(Comparison {
                identifier,
                op,
                literal,
            });

            match iter.next() {
                None => break,
                Some(Token::Word(w)) if w.eq_ignore_ascii_case("and") => continue,
                Some(other) => return Err(invalid(format!("expected AND, found {other:?}"))),
            }
        }

        Ok(Self {
            expression: expression.to_string(),
            terms,
        })
    }
}

impl Filter for ExpressionFilter {
    fn matches(&self, message: &ServerMessage) -> bool {
        self.terms.iter().all(|term| term.evaluate(message))
    }

    fn expression(&self) -> Option<&str> {
        Some(&self.expression)
    }
}

impl Comparison {
    fn evaluate(&self, message: &ServerMessage) -> bool {
        let value = match resolve(message, &self.identifier) {
            Some(v) => v,
            None => return false,
        };
        let ordering = match (&value, &self.literal) {
            (PropertyValue::Int(a), Literal::Int(b)) => a.cmp(b),
            (PropertyValue::Float(a), Literal::Int(b)) => {
                match a.partial_cmp(&(*b as f64)) {
                    Some(o) => o,
                    None => return false,
                }
            }
            (PropertyValue::String(a), Literal::Str(b)) => a.as_str().cmp(b.as_str()),
            (PropertyValue::Bool(a), Literal::Bool(b)) => a.cmp(b),
            _ => return self.op == Op::Ne,
        };
        match self.op {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
        }
    }
}

fn resolve(message: &ServerMessage, identifier: &str) -> Option<PropertyValue> {
    match identifier {
        "relay.id" => Some(PropertyValue::Int(message.id() as i64)),
        "relay.address" => Some(PropertyValue::String(message.address().to_string())),
        "relay.priority" => Some(PropertyValue::Int(i64::from(message.priority()))),
        "relay.durable" => Some(PropertyValue::Bool(message.is_durable())),
        "relay.timestamp" => Some(PropertyValue::Int(message.timestamp() as i64)),
        other => message.property(other).cloned(),
    }
}

fn parse_word_literal(word: &str) -> Option<Literal> {
    if word.eq_ignore_ascii_case("true") {
        return Some(Literal::Bool(true));
    }
    if word.eq_ignore_ascii_case("false") {
        return Some(Literal::Bool(false));
    }
    word.parse::<i64>().ok().map(Literal::Int)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Op(Op),
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".to_string()),
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        value.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        value.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
        } else if matches!(c, '=' | '<' | '>' | '!') {
            let next = chars.get(i + 1).copied();
            let (op, width) = match (c, next) {
                ('=', _) => (Op::Eq, 1),
                ('<', Some('>')) => (Op::Ne, 2),
                ('!', Some('=')) => (Op::Ne, 2),
                ('<', Some('=')) => (Op::Le, 2),
                ('>', Some('=')) => (Op::Ge, 2),
                ('<', _) => (Op::Lt, 1),
                ('>', _) => (Op::Gt, 1),
                _ => return Err(format!("unexpected character {c:?}")),
            };
            tokens.push(Token::Op(op));
            i += width;
        } else if c.is_alphanumeric() || matches!(c, '_' | '.' | '-') {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            return Err(format!("unexpected character {c:?}"));
        }
    }

    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message() -> ServerMessage {
        ServerMessage::new(7, "orders.eu", Bytes::new())
            .with_priority(6)
            .with_property("color", "red")
            .with_property("size", 3i64)
            .with_property("urgent", true)
    }

    #[test]
    fn equality_and_conjunction() {
        let filter = ExpressionFilter::parse("color = 'red' AND size = 3").unwrap();
        assert!(filter.matches(&message()));
        let filter = ExpressionFilter::parse("color = 'red' and size <> 3").unwrap();
        assert!(!filter.matches(&message()));
    }

    #[test]
    fn ordering_and_headers() {
        let msg = message();
        assert!(ExpressionFilter::parse("size >= 3").unwrap().matches(&msg));
        assert!(!ExpressionFilter::parse("size < 3").unwrap().matches(&msg));
        assert!(ExpressionFilter::parse("relay.priority > 4").unwrap().matches(&msg));
        assert!(ExpressionFilter::parse("relay.address = 'orders.eu'")
            .unwrap()
            .matches(&msg));
        assert!(ExpressionFilter::parse("urgent = TRUE").unwrap().matches(&msg));
    }

    #[test]
    fn missing_property_never_matches() {
        let filter = ExpressionFilter::parse("missing = 'x'").unwrap();
        assert!(!filter.matches(&message()));
    }

    #[test]
    fn quoted_strings_escape_quotes() {
        let msg = ServerMessage::new(1, "a", Bytes::new()).with_property("name", "o'brien");
        assert!(ExpressionFilter::parse("name = 'o''brien'").unwrap().matches(&msg));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in ["color", "color = ", "= 'red'", "color = 'red' OR size = 3", "a = 'x"] {
            assert!(
                matches!(ExpressionFilter::parse(expr), Err(BrokerError::InvalidFilter { .. })),
                "{expr}"
            );
        }
    }

    #[test]
    fn blank_filter_is_none() {
        assert!(parse_filter(None).unwrap().is_none());
        assert!(parse_filter(Some("  ")).unwrap().is_none());
        assert!(parse_filter(Some("a = 1")).unwrap().is_some());
    }
}
