//! Boolean conditions used by `{? .. if .. else ..}`, `IF(..)` and `SWITCH(..)`.
//!
//! ```text
//! Condition   ::= Disjunction
//! Disjunction ::= Conjunction ( 'OR' Conjunction )*
//! Conjunction ::= Negation ( 'AND' Negation )*
//! Negation    ::= 'NOT'* Root
//! Root        ::= '(' Condition ')' | Comparison | Predicate | 'ANYTHING' | 'NOTHING'
//! ```
//!
//! Evaluation yields `None` when a terminal error was logged.

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use regex::Regex;

use pipescript_grammar::{self as grammar, Aggregate, Category, CompOp};
use pipescript_types::{ErrorLog, ItemScope, ScriptError};

use crate::context::{Context, Runtime};
use crate::signature::parse_bool;
use crate::templated::TemplatedString;

#[derive(Debug, Clone)]
pub enum Condition {
    Comparison {
        lhs: TemplatedString,
        op: CompOp,
        rhs: TemplatedString,
    },
    Predicate {
        subject: TemplatedString,
        negated: bool,
        category: Category,
    },
    /// `ANYTHING` / `NOTHING`: whether the scope holds any items at all.
    Aggregate(Aggregate),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Build from a parsed condition, numbering implicit items from
    /// `start_index`. Returns the pre-errors and the next implicit index.
    pub fn from_ast(ast: &grammar::Condition, start_index: usize, rt: &Runtime) -> (Self, ErrorLog, usize) {
        let mut errors = ErrorLog::new();
        match ast {
            grammar::Condition::Comparison { lhs, op, rhs } => {
                let lhs = TemplatedString::from_elements(lhs, start_index, rt);
                let rhs = TemplatedString::from_elements(rhs, lhs.end_index, rt);
                errors.extend_in(&lhs.pre_errors, "left-hand side");
                errors.extend_in(&rhs.pre_errors, "right-hand side");
                let end = rhs.end_index;
                (Condition::Comparison { lhs, op: *op, rhs }, errors, end)
            }
            grammar::Condition::Predicate {
                subject,
                negated,
                category,
            } => {
                let subject = TemplatedString::from_elements(subject, start_index, rt);
                errors.extend(&subject.pre_errors);
                let end = subject.end_index;
                let cond = Condition::Predicate {
                    subject,
                    negated: *negated,
                    category: *category,
                };
                (cond, errors, end)
            }
            grammar::Condition::Aggregate(agg) => (Condition::Aggregate(*agg), errors, start_index),
            grammar::Condition::Not(inner) => {
                let (inner, errs, end) = Self::from_ast(inner, start_index, rt);
                (Condition::Not(Box::new(inner)), errs, end)
            }
            grammar::Condition::And(children) | grammar::Condition::Or(children) => {
                let mut index = start_index;
                let mut built = Vec::with_capacity(children.len());
                for child in children {
                    let (cond, errs, end) = Self::from_ast(child, index, rt);
                    errors.extend(&errs);
                    index = end;
                    built.push(cond);
                }
                let cond = match ast {
                    grammar::Condition::And(_) => Condition::And(built),
                    _ => Condition::Or(built),
                };
                (cond, errors, index)
            }
        }
    }

    /// Parse a standalone condition string.
    pub fn parse(text: &str, rt: &Runtime) -> (Option<Self>, ErrorLog) {
        match grammar::parse_condition(text) {
            Ok(ast) => {
                let (cond, errors, _) = Self::from_ast(&ast, 0, rt);
                (Some(cond), errors)
            }
            Err(e) => {
                let mut errors = ErrorLog::new();
                errors.log_parse_error(&e);
                (None, errors)
            }
        }
    }

    pub fn evaluate<'a>(
        &'a self,
        ctx: &'a Context,
        scope: Option<&'a ItemScope>,
    ) -> BoxFuture<'a, (Option<bool>, ErrorLog)> {
        async move {
            match self {
                Condition::Comparison { lhs, op, rhs } => self.compare(lhs, *op, rhs, ctx, scope).await,

                Condition::Predicate {
                    subject,
                    negated,
                    category,
                } => {
                    let (value, errors) = subject.evaluate(ctx, scope).await;
                    match value.filter(|_| !errors.is_terminal()) {
                        Some(value) => (Some(is_category(&value, *category) != *negated), errors),
                        None => (None, errors),
                    }
                }

                Condition::Aggregate(agg) => {
                    let any = scope.is_some_and(|s| !s.is_empty());
                    let result = match agg {
                        Aggregate::Anything => any,
                        Aggregate::Nothing => !any,
                    };
                    (Some(result), ErrorLog::new())
                }

                Condition::Not(inner) => {
                    let (value, errors) = inner.evaluate(ctx, scope).await;
                    (value.map(|v| !v), errors)
                }

                // Short-circuit on the determining value, but keep every warning seen so far.
                Condition::And(children) | Condition::Or(children) => {
                    let decisive = matches!(self, Condition::Or(_));
                    let mut errors = ErrorLog::new();
                    for child in children {
                        let (value, errs) = child.evaluate(ctx, scope).await;
                        errors.extend(&errs);
                        match value {
                            None => return (None, errors),
                            Some(_) if errors.is_terminal() => return (None, errors),
                            Some(v) if v == decisive => return (Some(decisive), errors),
                            Some(_) => {}
                        }
                    }
                    (Some(!decisive), errors)
                }
            }
        }
        .boxed()
    }

    async fn compare(
        &self,
        lhs: &TemplatedString,
        op: CompOp,
        rhs: &TemplatedString,
        ctx: &Context,
        scope: Option<&ItemScope>,
    ) -> (Option<bool>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let (left, errs) = lhs.evaluate(ctx, scope).await;
        errors.extend_in(&errs, "left-hand side");
        let (right, errs) = rhs.evaluate(ctx, scope).await;
        errors.extend_in(&errs, "right-hand side");
        let (Some(left), Some(right)) = (left, right) else {
            return (None, errors);
        };
        if errors.is_terminal() {
            return (None, errors);
        }

        let result = match op {
            CompOp::Eq => Ok(left == right),
            CompOp::NotEq => Ok(left != right),
            CompOp::Lt | CompOp::Gt | CompOp::LtEq | CompOp::GtEq => {
                numeric(&left).and_then(|l| numeric(&right).map(|r| match op {
                    CompOp::Lt => l < r,
                    CompOp::Gt => l > r,
                    CompOp::LtEq => l <= r,
                    _ => l >= r,
                }))
            }
            CompOp::Like | CompOp::NotLike => Regex::new(&right)
                .map(|re| re.is_match(&left) == (op == CompOp::Like))
                .map_err(ScriptError::from),
        };
        match result {
            Ok(value) => (Some(value), errors),
            Err(e) => {
                errors.log_error(format!("Failed to evaluate condition `{self}`"), &e);
                (None, errors)
            }
        }
    }
}

fn numeric(value: &str) -> Result<f64, ScriptError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ScriptError::Value(format!("Could not convert \"{value}\" to a number.")))
}

fn is_category(value: &str, category: Category) -> bool {
    match category {
        Category::White => value.trim().is_empty(),
        Category::Empty => value.is_empty(),
        Category::True => parse_bool(value) == Some(true),
        Category::False => parse_bool(value) == Some(false),
        Category::Bool => parse_bool(value).is_some(),
        Category::Int => value.trim().parse::<i64>().is_ok(),
        Category::Float => value.trim().parse::<f64>().is_ok(),
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, children: &[Condition], joiner: &str| {
            let shown: Vec<String> = children.iter().map(|c| c.to_string()).collect();
            write!(f, "({})", shown.join(joiner))
        };
        match self {
            Condition::Comparison { lhs, op, rhs } => write!(f, "{lhs} {} {rhs}", op.as_str()),
            Condition::Predicate {
                subject,
                negated,
                category,
            } => write!(
                f,
                "{subject} IS {}{}",
                if *negated { "NOT " } else { "" },
                category.as_str()
            ),
            Condition::Aggregate(Aggregate::Anything) => f.write_str("ANYTHING"),
            Condition::Aggregate(Aggregate::Nothing) => f.write_str("NOTHING"),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
            Condition::And(children) => join(f, children, " AND "),
            Condition::Or(children) => join(f, children, " OR "),
        }
    }
}
