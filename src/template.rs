//! C1 — the `{{path}}` template engine.
//!
//! A template is any string containing zero or more `{{<path>}}`
//! expressions. Resolution walks the [`crate::context::TemplateContext`]
//! hierarchically: `input.x.y`, `tasks.<id>.output.<field...>`, and
//! `forEach.<itemVar>.<field...>`.

use serde_json::Value;
use snafu::prelude::*;

use crate::context::TemplateContext;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid template '{template}': {reason}"))]
    InvalidTemplate { template: String, reason: String },

    #[snafu(display("field '{path}' is not present in the execution context"))]
    MissingField { path: String },

    #[snafu(display("task '{task_id}' has not produced output yet"))]
    TaskNotCompleted { task_id: String },

    #[snafu(display("cannot apply field access to a non-object value at '{path}'"))]
    TypeError { path: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One parsed piece of a template string: either literal text or an
/// expression path to resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Expr(String),
}

/// Split a template string into literal and expression segments.
///
/// # Errors
/// Returns [`Error::InvalidTemplate`] when braces are unbalanced.
pub fn parse(template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if template[i..].starts_with("{{") {
            let Some(end_rel) = template[i + 2..].find("}}") else {
                return Err(Error::InvalidTemplate {
                    template: template.to_string(),
                    reason: "unbalanced '{{' with no matching '}}'".into(),
                });
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let path = template[i + 2..i + 2 + end_rel].trim().to_string();
            validate_root_segment(&path, template)?;
            segments.push(Segment::Expr(path));
            i += 2 + end_rel + 2;
        } else if template[i..].starts_with("}}") {
            return Err(Error::InvalidTemplate {
                template: template.to_string(),
                reason: "unbalanced '}}' with no matching '{{'".into(),
            });
        } else {
            let ch = template[i..].chars().next().unwrap_or('\u{0}');
            literal.push(ch);
            i += ch.len_utf8();
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn validate_root_segment(path: &str, template: &str) -> Result<()> {
    let root = path.split('.').next().unwrap_or("");
    if matches!(root, "input" | "tasks" | "forEach") {
        Ok(())
    } else {
        Err(Error::InvalidTemplate {
            template: template.to_string(),
            reason: format!("unknown root segment '{root}'"),
        })
    }
}

/// Resolve a template against a context.
///
/// When the template is a single expression with no surrounding literal
/// text, the typed referent is returned (numbers/booleans/arrays/objects
/// preserved). Otherwise every expression is stringified and concatenated
/// with the literal text around it.
///
/// # Errors
/// See [`Error`].
pub fn resolve(template: &str, ctx: &TemplateContext) -> Result<Value> {
    let segments = parse(template)?;

    if let [Segment::Expr(path)] = segments.as_slice() {
        return resolve_path(path, ctx);
    }

    let mut out = String::new();
    for seg in &segments {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Expr(path) => {
                let v = resolve_path(path, ctx)?;
                out.push_str(&stringify(&v));
            }
        }
    }
    Ok(Value::String(out))
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve a single dotted path without going through the literal/template
/// splitter — used by `condition` to evaluate one `{{...}}` segment at a
/// time while it reassembles the surrounding literal text.
pub fn resolve_path_public(path: &str, ctx: &TemplateContext) -> Result<Value> {
    resolve_path(path, ctx)
}

fn resolve_path(path: &str, ctx: &TemplateContext) -> Result<Value> {
    let mut parts = path.split('.');
    let root = parts.next().unwrap_or("");
    match root {
        "input" => walk(ctx.input(), parts, path),
        "forEach" => {
            let frame = ctx.for_each().ok_or_else(|| Error::MissingField {
                path: path.to_string(),
            })?;
            let item_var = parts.next().ok_or_else(|| Error::MissingField {
                path: path.to_string(),
            })?;
            if item_var == frame.index_var {
                return Ok(Value::Number(frame.index.into()));
            }
            if item_var != frame.item_var {
                return Err(Error::MissingField {
                    path: path.to_string(),
                });
            }
            walk(&frame.current_item, parts, path)
        }
        "tasks" => {
            let task_id = parts.next().ok_or_else(|| Error::MissingField {
                path: path.to_string(),
            })?;
            let Some(entry) = ctx.task_output(task_id) else {
                return Err(Error::TaskNotCompleted {
                    task_id: task_id.to_string(),
                });
            };
            if !entry.completed {
                return Err(Error::TaskNotCompleted {
                    task_id: task_id.to_string(),
                });
            }
            let rest: Vec<&str> = parts.collect();
            let Some(first) = rest.first() else {
                return Ok(entry.output.clone());
            };
            if *first != "output" {
                return Err(Error::MissingField {
                    path: path.to_string(),
                });
            }
            walk(&entry.output, rest.into_iter().skip(1), path)
        }
        _ => Err(Error::MissingField {
            path: path.to_string(),
        }),
    }
}

fn walk<'a>(
    root: &Value,
    rest: impl Iterator<Item = &'a str>,
    full_path: &str,
) -> Result<Value> {
    let mut current = root.clone();
    for field in rest {
        match &current {
            Value::Object(map) => {
                current = map
                    .get(field)
                    .cloned()
                    .ok_or_else(|| Error::MissingField {
                        path: full_path.to_string(),
                    })?;
            }
            _ => {
                return Err(Error::TypeError {
                    path: full_path.to_string(),
                });
            }
        }
    }
    Ok(current)
}

/// Best-effort scan for `tasks.<id>...` references inside a string,
/// tolerant of surrounding non-template text (condition/switch expressions
/// embed `{{...}}` the same way task inputs do). Used only to discover
/// implicit graph dependencies (C2 step 3) — never for resolution, so it
/// never errors.
#[must_use]
pub fn extract_task_refs(s: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let path = after[..end].trim();
        if let Some(id) = path.strip_prefix("tasks.") {
            if let Some(task_id) = id.split('.').next() {
                ids.push(task_id.to_string());
            }
        }
        rest = &after[end + 2..];
    }
    ids
}

/// Resolve every entry in a field→template mapping. Either all succeed or
/// the call fails with the first accumulated error list joined together.
///
/// # Errors
/// Returns the first error encountered, with all error messages joined.
pub fn resolve_mapping(
    mapping: &std::collections::HashMap<String, String>,
    ctx: &TemplateContext,
) -> Result<serde_json::Map<String, Value>> {
    let mut out = serde_json::Map::new();
    let mut errors = Vec::new();
    for (field, tmpl) in mapping {
        match resolve(tmpl, ctx) {
            Ok(v) => {
                out.insert(field.clone(), v);
            }
            Err(e) => errors.push(format!("{field}: {e}")),
        }
    }
    if let Some(first) = errors.first() {
        return Err(Error::MissingField {
            path: errors.join("; ").to_string(),
        })
        .inspect_err(|_| {
            tracing::debug!("resolve_mapping failed: {first}");
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ForEachFrame, TaskOutputEntry};
    use std::collections::HashMap;

    fn ctx_with_input(input: serde_json::Value) -> TemplateContext {
        TemplateContext::new(input)
    }

    #[test]
    fn no_expressions_returns_unchanged() {
        let ctx = ctx_with_input(serde_json::json!({}));
        let resolved = resolve("plain text", &ctx).unwrap();
        assert_eq!(resolved, Value::String("plain text".into()));
    }

    #[test]
    fn single_expression_preserves_type() {
        let ctx = ctx_with_input(serde_json::json!({"x": {"y": 7}}));
        let resolved = resolve("{{input.x.y}}", &ctx).unwrap();
        assert_eq!(resolved, serde_json::json!(7));
    }

    #[test]
    fn mixed_literal_and_expr_stringifies() {
        let ctx = ctx_with_input(serde_json::json!({"name": "world"}));
        let resolved = resolve("hello {{input.name}}!", &ctx).unwrap();
        assert_eq!(resolved, Value::String("hello world!".into()));
    }

    #[test]
    fn unbalanced_braces_is_invalid_template() {
        let ctx = ctx_with_input(serde_json::json!({}));
        let err = resolve("{{input.x", &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidTemplate { .. }));
    }

    #[test]
    fn task_not_completed_is_distinct_error() {
        let mut ctx = ctx_with_input(serde_json::json!({}));
        ctx.set_task_output(
            "a",
            TaskOutputEntry {
                output: serde_json::json!({"v": 1}),
                completed: false,
            },
        );
        let err = resolve("{{tasks.a.output.v}}", &ctx).unwrap_err();
        assert!(matches!(err, Error::TaskNotCompleted { .. }));
    }

    #[test]
    fn field_access_on_scalar_is_type_error() {
        let mut ctx = ctx_with_input(serde_json::json!({}));
        ctx.set_task_output(
            "a",
            TaskOutputEntry {
                output: serde_json::json!({"v": 1}),
                completed: true,
            },
        );
        let err = resolve("{{tasks.a.output.v.nested}}", &ctx).unwrap_err();
        assert!(matches!(err, Error::TypeError { .. }));
    }

    #[test]
    fn for_each_frame_resolves_item_and_index() {
        let mut ctx = ctx_with_input(serde_json::json!({}));
        ctx.push_for_each_frame(ForEachFrame {
            item_var: "item".into(),
            index_var: "index".into(),
            current_item: serde_json::json!({"id": 42}),
            index: 3,
        });
        assert_eq!(
            resolve("{{forEach.item.id}}", &ctx).unwrap(),
            serde_json::json!(42)
        );
        assert_eq!(resolve("{{forEach.index}}", &ctx).unwrap(), serde_json::json!(3));
    }

    #[test]
    fn resolve_mapping_aggregates_all_fields() {
        let ctx = ctx_with_input(serde_json::json!({"a": 1, "b": 2}));
        let mut mapping = HashMap::new();
        mapping.insert("x".to_string(), "{{input.a}}".to_string());
        mapping.insert("y".to_string(), "{{input.b}}".to_string());
        let resolved = resolve_mapping(&mapping, &ctx).unwrap();
        assert_eq!(resolved.get("x").unwrap(), &serde_json::json!(1));
        assert_eq!(resolved.get("y").unwrap(), &serde_json::json!(2));
    }

    #[test]
    fn idempotent_when_result_has_no_references() {
        let ctx = ctx_with_input(serde_json::json!({"a": 1}));
        let once = resolve("{{input.a}}", &ctx).unwrap();
        // resolving the stringified/typed result again (as a literal, not a template)
        // is a no-op since it contains no further `{{}}` expressions.
        let twice = resolve(&stringify(&once), &ctx).unwrap();
        assert_eq!(once, serde_json::json!(1));
        assert_eq!(twice, Value::String("1".into()));
    }
}
