//! C3 — the condition and switch expression evaluator.
//!
//! Grounded on `adamtc007-data-designer`'s `parser.rs`: the same
//! precedence-climbing shape (`primary -> unary -> comparison -> and -> or`)
//! built with `nom`, trimmed to the boolean/comparison operator set this
//! spec actually needs (`==,!=,<,<=,>,>=,&&,||,!`, parens).
//!
//! A condition or switch string first has every `{{...}}` template
//! expression substituted with its resolved value's literal textual form —
//! that substituted string is the diagnostic `evaluated_expression` — and
//! only the resulting literal-only expression is handed to the parser.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map, map_res, opt, recognize, value};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use serde_json::Value as Json;
use snafu::prelude::*;

use crate::context::TemplateContext;
use crate::template;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve embedded expression in '{source_text}': {reason}"))]
    TemplateResolution { source_text: String, reason: String },

    #[snafu(display("could not parse expression '{evaluated}'"))]
    ParseFailure { evaluated: String },

    #[snafu(display("type mismatch comparing {left} and {right} in '{evaluated}'"))]
    TypeMismatch {
        evaluated: String,
        left: String,
        right: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of evaluating a task's `condition` string.
#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    pub should_execute: bool,
    pub evaluated_expression: String,
}

/// Outcome of evaluating a task's `switch` block.
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub task_ref: String,
    pub matched_value: Json,
    pub evaluated_value: Json,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Literal),
    Not(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

/// Evaluate a task's `condition` string against a context.
///
/// # Errors
/// Returns [`Error`] if an embedded expression fails to resolve, the
/// substituted expression fails to parse, or a comparison mixes types.
pub fn evaluate_condition(condition: &str, ctx: &TemplateContext) -> Result<ConditionOutcome> {
    let evaluated_expression = substitute(condition, ctx)?;
    let expr = parse_expr(&evaluated_expression)?;
    let value = eval(&expr, &evaluated_expression)?;
    Ok(ConditionOutcome {
        should_execute: truthy(&value),
        evaluated_expression,
    })
}

/// Evaluate a task's `switch` block: resolve `value`, then test cases in
/// order, falling back to `default`.
///
/// # Errors
/// Returns [`Error::TemplateResolution`] if `value` fails to resolve, or if
/// no case matches and no default is configured (surfaced by the caller as
/// a missing-match condition rather than an [`Error`] variant here).
pub fn evaluate_switch(
    value_template: &str,
    cases: &[(String, String)],
    default: Option<&str>,
    ctx: &TemplateContext,
) -> Result<Option<SwitchOutcome>> {
    let evaluated_value = template::resolve(value_template, ctx).map_err(|e| Error::TemplateResolution {
        source_text: value_template.to_string(),
        reason: e.to_string(),
    })?;

    for (match_literal, task_ref) in cases {
        let matched_value = parse_literal_text(match_literal);
        if json_eq(&evaluated_value, &matched_value) {
            return Ok(Some(SwitchOutcome {
                task_ref: task_ref.clone(),
                matched_value,
                evaluated_value,
                is_default: false,
            }));
        }
    }

    Ok(default.map(|task_ref| SwitchOutcome {
        task_ref: task_ref.to_string(),
        matched_value: Json::Null,
        evaluated_value: evaluated_value.clone(),
        is_default: true,
    }))
}

fn parse_literal_text(s: &str) -> Json {
    serde_json::from_str(s).unwrap_or_else(|_| Json::String(s.to_string()))
}

/// Switch-case equality: strings compare case-insensitively, everything
/// else falls back to exact equality.
fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::String(a), Json::String(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => a == b,
    }
}

fn truthy(v: &Json) -> bool {
    match v {
        Json::Bool(b) => *b,
        Json::Null => false,
        Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

/// Replace every `{{...}}` expression with its resolved value's literal
/// textual form: numbers/booleans/null unquoted, strings JSON-quoted.
fn substitute(condition: &str, ctx: &TemplateContext) -> Result<String> {
    let segments = template::parse(condition).map_err(|e| Error::TemplateResolution {
        source_text: condition.to_string(),
        reason: e.to_string(),
    })?;

    let mut out = String::new();
    for seg in segments {
        match seg {
            template::Segment::Literal(s) => out.push_str(&s),
            template::Segment::Expr(path) => {
                let resolved = template::resolve_path_public(&path, ctx).map_err(|e| Error::TemplateResolution {
                    source_text: condition.to_string(),
                    reason: e.to_string(),
                })?;
                out.push_str(&literal_text(&resolved));
            }
        }
    }
    Ok(out)
}

fn literal_text(v: &Json) -> String {
    match v {
        Json::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\"")),
        other => other.to_string(),
    }
}

// ---- nom grammar ----

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn parse_number(input: &str) -> IResult<&str, Literal> {
    map_res(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |s: &str| s.parse::<f64>().map(Literal::Number),
    )(input)
}

fn parse_string(input: &str) -> IResult<&str, Literal> {
    map(
        delimited(
            char('"'),
            nom::bytes::complete::escaped_transform(
                nom::character::complete::none_of("\"\\"),
                '\\',
                alt((
                    value('\\', char('\\')),
                    value('"', char('"')),
                    value('\n', char('n')),
                )),
            ),
            char('"'),
        ),
        Literal::Str,
    )(input)
}

fn parse_bool(input: &str) -> IResult<&str, Literal> {
    alt((
        value(Literal::Bool(true), tag("true")),
        value(Literal::Bool(false), tag("false")),
    ))(input)
}

fn parse_null(input: &str) -> IResult<&str, Literal> {
    value(Literal::Null, tag("null"))(input)
}

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(parse_number, Expr::Literal),
        map(parse_string, Expr::Literal),
        map(parse_bool, Expr::Literal),
        map(parse_null, Expr::Literal),
        delimited(ws(char('(')), parse_or, ws(char(')'))),
    )))(input)
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), parse_unary), |e| Expr::Not(Box::new(e))),
        parse_primary,
    ))(input)
}

fn parse_comparison(input: &str) -> IResult<&str, Expr> {
    let (input, left) = parse_unary(input)?;
    let (input, op) = opt(tuple((
        ws(alt((
            value(BinOp::Le, tag("<=")),
            value(BinOp::Ge, tag(">=")),
            value(BinOp::Ne, tag("!=")),
            value(BinOp::Eq, tag("==")),
            value(BinOp::Lt, tag("<")),
            value(BinOp::Gt, tag(">")),
        ))),
        parse_unary,
    )))(input)?;
    Ok((
        input,
        match op {
            Some((op, right)) => Expr::Binary(Box::new(left), op, Box::new(right)),
            None => left,
        },
    ))
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (input, left) = parse_comparison(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), parse_comparison))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(left, |acc, right| Expr::Binary(Box::new(acc), BinOp::And, Box::new(right))),
    ))
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (input, left) = parse_and(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), parse_and))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(left, |acc, right| Expr::Binary(Box::new(acc), BinOp::Or, Box::new(right))),
    ))
}

fn parse_expr(input: &str) -> Result<Expr> {
    match ws(parse_or)(input) {
        Ok((remaining, expr)) if remaining.trim().is_empty() => Ok(expr),
        _ => Err(Error::ParseFailure {
            evaluated: input.to_string(),
        }),
    }
}

fn to_json(lit: &Literal) -> Json {
    match lit {
        Literal::Number(n) => serde_json::json!(n),
        Literal::Str(s) => Json::String(s.clone()),
        Literal::Bool(b) => Json::Bool(*b),
        Literal::Null => Json::Null,
    }
}

fn type_name(lit: &Literal) -> &'static str {
    match lit {
        Literal::Number(_) => "number",
        Literal::Str(_) => "string",
        Literal::Bool(_) => "boolean",
        Literal::Null => "null",
    }
}

/// Evaluate a parsed expression tree to a JSON boolean/scalar.
/// Short-circuits `&&`/`||`; numeric comparisons require both operands to
/// be numbers, string equality requires both to be strings, and `null`
/// equals only `null`.
fn eval(expr: &Expr, source: &str) -> Result<Json> {
    match expr {
        Expr::Literal(lit) => Ok(to_json(lit)),
        Expr::Not(inner) => Ok(Json::Bool(!truthy(&eval(inner, source)?))),
        Expr::Binary(left, BinOp::And, right) => {
            let l = eval(left, source)?;
            if !truthy(&l) {
                return Ok(Json::Bool(false));
            }
            Ok(Json::Bool(truthy(&eval(right, source)?)))
        }
        Expr::Binary(left, BinOp::Or, right) => {
            let l = eval(left, source)?;
            if truthy(&l) {
                return Ok(Json::Bool(true));
            }
            Ok(Json::Bool(truthy(&eval(right, source)?)))
        }
        Expr::Binary(left, op, right) => eval_comparison(left, *op, right, source),
    }
}

fn eval_comparison(left: &Expr, op: BinOp, right: &Expr, source: &str) -> Result<Json> {
    let (Expr::Literal(l), Expr::Literal(r)) = (left, right) else {
        let l = eval(left, source)?;
        let r = eval(right, source)?;
        return compare_json(&l, &r, op, source);
    };

    match (l, r) {
        (Literal::Null, Literal::Null) => Ok(Json::Bool(matches!(op, BinOp::Eq))),
        (Literal::Null, _) | (_, Literal::Null) => Ok(Json::Bool(matches!(op, BinOp::Ne))),
        (Literal::Number(a), Literal::Number(b)) => Ok(Json::Bool(match op {
            BinOp::Eq => (a - b).abs() < f64::EPSILON,
            BinOp::Ne => (a - b).abs() >= f64::EPSILON,
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            BinOp::And | BinOp::Or => unreachable!("handled in eval"),
        })),
        (Literal::Str(a), Literal::Str(b)) => Ok(Json::Bool(match op {
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            BinOp::And | BinOp::Or => unreachable!("handled in eval"),
        })),
        (Literal::Bool(a), Literal::Bool(b)) => Ok(Json::Bool(match op {
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            _ => {
                return Err(Error::TypeMismatch {
                    evaluated: source.to_string(),
                    left: type_name(l).to_string(),
                    right: type_name(r).to_string(),
                })
            }
        })),
        (a, b) => Err(Error::TypeMismatch {
            evaluated: source.to_string(),
            left: type_name(a).to_string(),
            right: type_name(b).to_string(),
        }),
    }
}

fn compare_json(l: &Json, r: &Json, op: BinOp, source: &str) -> Result<Json> {
    match (l, r) {
        (Json::Number(a), Json::Number(b)) => Ok(Json::Bool(match op {
            BinOp::Eq => a.as_f64() == b.as_f64(),
            BinOp::Ne => a.as_f64() != b.as_f64(),
            BinOp::Lt => a.as_f64() < b.as_f64(),
            BinOp::Le => a.as_f64() <= b.as_f64(),
            BinOp::Gt => a.as_f64() > b.as_f64(),
            BinOp::Ge => a.as_f64() >= b.as_f64(),
            BinOp::And | BinOp::Or => unreachable!("handled in eval"),
        })),
        (Json::String(a), Json::String(b)) => Ok(Json::Bool(match op {
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            BinOp::And | BinOp::Or => unreachable!("handled in eval"),
        })),
        (Json::Null, Json::Null) => Ok(Json::Bool(matches!(op, BinOp::Eq))),
        (Json::Null, _) | (_, Json::Null) => Ok(Json::Bool(matches!(op, BinOp::Ne))),
        _ => Err(Error::TypeMismatch {
            evaluated: source.to_string(),
            left: l.to_string(),
            right: r.to_string(),
        }),
    }
}
