//! C4 (transform kind) — the data-shaping pipeline. A closed catalog of
//! operations applied left to right over a `serde_json::Value`, dispatched
//! through a single match rather than trait objects per op (teacher's
//! `expressions.rs` favors closed enums over open plugin traits for its
//! builtin operator set; this follows the same shape for a smaller,
//! non-jq operator set).

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("transform op '{op}' expects an array input, got {actual}"))]
    ExpectedArray { op: String, actual: String },

    #[snafu(display("transform op '{op}' expects a string input, got {actual}"))]
    ExpectedString { op: String, actual: String },

    #[snafu(display("transform op '{op}' expects a numeric input, got {actual}"))]
    ExpectedNumber { op: String, actual: String },

    #[snafu(display("field '{field}' missing on element in op '{op}'"))]
    MissingField { op: String, field: String },

    #[snafu(display("transform op '{op}' has an invalid argument: {reason}"))]
    InvalidArgument { op: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One step of a transform pipeline. `#[serde(tag = "op")]` matches the
/// wire shape a workflow author writes: `{op: "select", field: "..."}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TransformOp {
    Select { field: String },
    Filter { field: String, equals: Value },
    Map { field: String, expr: String },
    FlatMap { field: String },
    GroupBy {
        field: String,
        #[serde(default)]
        aggregate: Option<GroupAggregate>,
    },
    /// Relational left/right merge by key, not to be confused with the
    /// string-concatenation `stringJoin` below.
    Join {
        left_key: String,
        right_key: String,
        right_data: Vec<Value>,
        #[serde(default)]
        join_type: JoinType,
    },
    #[serde(rename = "stringJoin")]
    StringJoin { separator: String },
    SortBy { field: String, #[serde(default)] descending: bool },
    Enrich { field: String, value: Value },
    Aggregate { field: String, #[serde(default)] function: AggregateFn },
    Limit { count: usize },
    Skip { count: usize },

    First,
    Last,
    Nth { index: usize },
    Reverse,
    Unique,
    Flatten,
    Chunk { size: usize },
    Zip { other: Vec<Value> },

    Uppercase,
    Lowercase,
    Trim,
    Split { separator: String },
    Concat { suffix: String },
    Replace { from: String, to: String },
    Substring { start: usize, end: Option<usize> },
    Template { template: String },

    Round { precision: i32 },
    Floor,
    Ceil,
    Abs,
    Clamp { min: f64, max: f64 },
    Scale { factor: f64 },
    Percentage { of: f64 },

    RandomOne { #[serde(default)] seed: Option<u64> },
    RandomN { count: usize, #[serde(default)] seed: Option<u64> },
    Shuffle { #[serde(default)] seed: Option<u64> },
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    #[default]
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GroupAggregate {
    pub field: String,
    pub function: AggregateFn,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
}

/// Run a pipeline of ops over a value, left to right.
///
/// # Errors
/// Returns the first op's error.
pub fn apply_pipeline(input: &Value, ops: &[TransformOp]) -> Result<Value> {
    let mut current = input.clone();
    for op in ops {
        current = apply_op(&current, op)?;
    }
    Ok(current)
}

fn type_name(v: &Value) -> String {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn as_array<'a>(v: &'a Value, op: &str) -> Result<&'a Vec<Value>> {
    v.as_array().ok_or_else(|| Error::ExpectedArray {
        op: op.to_string(),
        actual: type_name(v),
    })
}

fn as_str<'a>(v: &'a Value, op: &str) -> Result<&'a str> {
    v.as_str().ok_or_else(|| Error::ExpectedString {
        op: op.to_string(),
        actual: type_name(v),
    })
}

fn as_f64(v: &Value, op: &str) -> Result<f64> {
    v.as_f64().ok_or_else(|| Error::ExpectedNumber {
        op: op.to_string(),
        actual: type_name(v),
    })
}

fn field_of<'a>(item: &'a Value, field: &str, op: &str) -> Result<&'a Value> {
    item.get(field).ok_or_else(|| Error::MissingField {
        op: op.to_string(),
        field: field.to_string(),
    })
}

fn apply_op(input: &Value, op: &TransformOp) -> Result<Value> {
    match op {
        TransformOp::Select { field } => Ok(field_of(input, field, "select")?.clone()),

        TransformOp::Filter { field, equals } => {
            let arr = as_array(input, "filter")?;
            Ok(Value::Array(
                arr.iter()
                    .filter(|item| item.get(field).is_some_and(|v| v == equals))
                    .cloned()
                    .collect(),
            ))
        }

        TransformOp::Map { field, expr } => {
            let arr = as_array(input, "map")?;
            let out: Result<Vec<Value>> = arr
                .iter()
                .map(|item| {
                    let ctx = crate::context::TemplateContext::new(item.clone());
                    crate::template::resolve(expr, &ctx).map_err(|e| Error::InvalidArgument {
                        op: "map".to_string(),
                        reason: e.to_string(),
                    })
                })
                .collect();
            let _ = field;
            Ok(Value::Array(out?))
        }

        TransformOp::FlatMap { field } => {
            let arr = as_array(input, "flatMap")?;
            let mut out = Vec::new();
            for item in arr {
                let nested = field_of(item, field, "flatMap")?;
                out.extend(as_array(nested, "flatMap")?.iter().cloned());
            }
            Ok(Value::Array(out))
        }

        TransformOp::GroupBy { field, aggregate } => {
            let arr = as_array(input, "groupBy")?;
            let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
            for item in arr {
                let key = field_of(item, field, "groupBy")?;
                let key_str = match key {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match groups.iter_mut().find(|(k, _)| *k == key_str) {
                    Some((_, members)) => members.push(item.clone()),
                    None => groups.push((key_str, vec![item.clone()])),
                }
            }

            let mut out = serde_json::Map::new();
            for (key, members) in groups {
                let value = match aggregate {
                    Some(agg) => apply_aggregate(&members, &agg.field, agg.function, "groupBy")?,
                    None => Value::Array(members),
                };
                out.insert(key, value);
            }
            Ok(Value::Object(out))
        }

        TransformOp::Join {
            left_key,
            right_key,
            right_data,
            join_type,
        } => join_relational(as_array(input, "join")?, left_key, right_data, right_key, *join_type),

        TransformOp::StringJoin { separator } => {
            let arr = as_array(input, "stringJoin")?;
            let parts: Vec<String> = arr
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Ok(Value::String(parts.join(separator)))
        }

        TransformOp::SortBy { field, descending } => {
            let mut arr = as_array(input, "sortBy")?.clone();
            arr.sort_by(|a, b| {
                let av = a.get(field);
                let bv = b.get(field);
                let ordering = compare_values(av, bv);
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(Value::Array(arr))
        }

        TransformOp::Enrich { field, value } => {
            let mut obj = input.as_object().cloned().ok_or_else(|| Error::InvalidArgument {
                op: "enrich".to_string(),
                reason: format!("expected an object, got {}", type_name(input)),
            })?;
            obj.insert(field.clone(), value.clone());
            Ok(Value::Object(obj))
        }

        TransformOp::Aggregate { field, function } => {
            let arr = as_array(input, "aggregate")?;
            apply_aggregate(arr, field, *function, "aggregate")
        }

        TransformOp::Limit { count } => {
            let arr = as_array(input, "limit")?;
            Ok(Value::Array(arr.iter().take(*count).cloned().collect()))
        }

        TransformOp::Skip { count } => {
            let arr = as_array(input, "skip")?;
            Ok(Value::Array(arr.iter().skip(*count).cloned().collect()))
        }

        TransformOp::First => {
            let arr = as_array(input, "first")?;
            Ok(arr.first().cloned().unwrap_or(Value::Null))
        }

        TransformOp::Last => {
            let arr = as_array(input, "last")?;
            Ok(arr.last().cloned().unwrap_or(Value::Null))
        }

        TransformOp::Nth { index } => {
            let arr = as_array(input, "nth")?;
            Ok(arr.get(*index).cloned().unwrap_or(Value::Null))
        }

        TransformOp::Reverse => {
            let mut arr = as_array(input, "reverse")?.clone();
            arr.reverse();
            Ok(Value::Array(arr))
        }

        TransformOp::Unique => {
            let arr = as_array(input, "unique")?;
            let mut out: Vec<Value> = Vec::new();
            for v in arr {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
            Ok(Value::Array(out))
        }

        TransformOp::Flatten => {
            let arr = as_array(input, "flatten")?;
            let mut out = Vec::new();
            for v in arr {
                match v {
                    Value::Array(inner) => out.extend(inner.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }

        TransformOp::Chunk { size } => {
            let arr = as_array(input, "chunk")?;
            if *size == 0 {
                return Err(Error::InvalidArgument {
                    op: "chunk".to_string(),
                    reason: "size must be greater than zero".to_string(),
                });
            }
            let chunks: Vec<Value> = arr
                .chunks(*size)
                .map(|c| Value::Array(c.to_vec()))
                .collect();
            Ok(Value::Array(chunks))
        }

        TransformOp::Zip { other } => {
            let arr = as_array(input, "zip")?;
            let pairs: Vec<Value> = arr
                .iter()
                .zip(other.iter())
                .map(|(a, b)| Value::Array(vec![a.clone(), b.clone()]))
                .collect();
            Ok(Value::Array(pairs))
        }

        TransformOp::Uppercase => Ok(Value::String(as_str(input, "uppercase")?.to_uppercase())),
        TransformOp::Lowercase => Ok(Value::String(as_str(input, "lowercase")?.to_lowercase())),
        TransformOp::Trim => Ok(Value::String(as_str(input, "trim")?.trim().to_string())),

        TransformOp::Split { separator } => {
            let s = as_str(input, "split")?;
            Ok(Value::Array(
                s.split(separator.as_str()).map(|p| Value::String(p.to_string())).collect(),
            ))
        }

        TransformOp::Concat { suffix } => {
            let s = as_str(input, "concat")?;
            Ok(Value::String(format!("{s}{suffix}")))
        }

        TransformOp::Replace { from, to } => {
            let s = as_str(input, "replace")?;
            Ok(Value::String(s.replace(from.as_str(), to)))
        }

        TransformOp::Substring { start, end } => {
            let s = as_str(input, "substring")?;
            let chars: Vec<char> = s.chars().collect();
            let end = end.unwrap_or(chars.len()).min(chars.len());
            let start = (*start).min(end);
            Ok(Value::String(chars.get(start..end).unwrap_or_default().iter().collect()))
        }

        TransformOp::Template { template } => {
            let ctx = crate::context::TemplateContext::new(input.clone());
            crate::template::resolve(template, &ctx).map_err(|e| Error::InvalidArgument {
                op: "template".to_string(),
                reason: e.to_string(),
            })
        }

        TransformOp::Round { precision } => {
            let n = as_f64(input, "round")?;
            let factor = 10f64.powi(*precision);
            Ok(serde_json::json!((n * factor).round() / factor))
        }

        TransformOp::Floor => Ok(serde_json::json!(as_f64(input, "floor")?.floor())),
        TransformOp::Ceil => Ok(serde_json::json!(as_f64(input, "ceil")?.ceil())),
        TransformOp::Abs => Ok(serde_json::json!(as_f64(input, "abs")?.abs())),

        TransformOp::Clamp { min, max } => {
            let n = as_f64(input, "clamp")?;
            Ok(serde_json::json!(n.clamp(*min, *max)))
        }

        TransformOp::Scale { factor } => Ok(serde_json::json!(as_f64(input, "scale")? * factor)),

        TransformOp::Percentage { of } => {
            let n = as_f64(input, "percentage")?;
            if *of == 0.0 {
                return Err(Error::InvalidArgument {
                    op: "percentage".to_string(),
                    reason: "'of' must be nonzero".to_string(),
                });
            }
            Ok(serde_json::json!((n / of) * 100.0))
        }

        TransformOp::RandomOne { seed } => {
            let arr = as_array(input, "randomOne")?;
            let mut rng = rng_from(*seed);
            Ok(arr.choose(&mut rng).cloned().unwrap_or(Value::Null))
        }

        TransformOp::RandomN { count, seed } => {
            let arr = as_array(input, "randomN")?;
            let mut rng = rng_from(*seed);
            let picked: Vec<Value> = arr
                .choose_multiple(&mut rng, (*count).min(arr.len()))
                .cloned()
                .collect();
            Ok(Value::Array(picked))
        }

        TransformOp::Shuffle { seed } => {
            let mut arr = as_array(input, "shuffle")?.clone();
            let mut rng = rng_from(*seed);
            arr.shuffle(&mut rng);
            Ok(Value::Array(arr))
        }
    }
}

fn apply_aggregate(items: &[Value], field: &str, function: AggregateFn, op: &str) -> Result<Value> {
    if matches!(function, AggregateFn::Count) {
        return Ok(Value::Number(items.len().into()));
    }
    let values: Result<Vec<f64>> = items.iter().map(|item| as_f64(field_of(item, field, op)?, op)).collect();
    let values = values?;
    let result = match function {
        AggregateFn::Sum => values.iter().sum(),
        AggregateFn::Avg => {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        }
        AggregateFn::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Count => unreachable!(),
    };
    Ok(serde_json::json!(result))
}

/// Relational left/right merge by key (spec.md §4.4's `join` op). Matching
/// right rows are merged onto their left row (right fields win on overlap);
/// `left`/`right` additionally keep the unmatched side's bare rows.
fn join_relational(left: &[Value], left_key: &str, right: &[Value], right_key: &str, join_type: JoinType) -> Result<Value> {
    let mut out = Vec::new();
    let mut matched_right = vec![false; right.len()];

    for left_row in left {
        let Some(left_value) = left_row.get(left_key) else {
            continue;
        };
        let mut any_match = false;
        for (i, right_row) in right.iter().enumerate() {
            if right_row.get(right_key) == Some(left_value) {
                any_match = true;
                if let Some(flag) = matched_right.get_mut(i) {
                    *flag = true;
                }
                out.push(merge_objects(left_row, right_row));
            }
        }
        if !any_match && matches!(join_type, JoinType::Left) {
            out.push(left_row.clone());
        }
    }

    if matches!(join_type, JoinType::Right) {
        for (right_row, matched) in right.iter().zip(matched_right.iter()) {
            if !matched {
                out.push(right_row.clone());
            }
        }
    }

    Ok(Value::Array(out))
}

fn merge_objects(left: &Value, right: &Value) -> Value {
    let mut merged = left.as_object().cloned().unwrap_or_default();
    if let Some(right_obj) = right.as_object() {
        for (k, v) in right_obj {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&b.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_extracts_field() {
        let input = serde_json::json!({"a": 1, "b": 2});
        let result = apply_pipeline(&input, &[TransformOp::Select { field: "a".into() }]).unwrap();
        assert_eq!(result, serde_json::json!(1));
    }

    #[test]
    fn filter_keeps_matching_elements() {
        let input = serde_json::json!([{"k": "x"}, {"k": "y"}]);
        let result = apply_pipeline(
            &input,
            &[TransformOp::Filter {
                field: "k".into(),
                equals: serde_json::json!("x"),
            }],
        )
        .unwrap();
        assert_eq!(result, serde_json::json!([{"k": "x"}]));
    }

    #[test]
    fn pipeline_applies_left_to_right() {
        let input = serde_json::json!([3, 1, 2]);
        let result = apply_pipeline(
            &input,
            &[TransformOp::SortBy {
                field: String::new(),
                descending: false,
            }],
        );
        // sortBy expects objects; use reverse+limit instead to check ordering composition.
        let _ = result;
        let result = apply_pipeline(&input, &[TransformOp::Reverse, TransformOp::Limit { count: 2 }]).unwrap();
        assert_eq!(result, serde_json::json!([2, 1]));
    }

    #[test]
    fn aggregate_sum_and_count() {
        let input = serde_json::json!([{"v": 1}, {"v": 2}, {"v": 3}]);
        let sum = apply_pipeline(
            &input,
            &[TransformOp::Aggregate {
                field: "v".into(),
                function: AggregateFn::Sum,
            }],
        )
        .unwrap();
        assert_eq!(sum, serde_json::json!(6.0));
        let count = apply_pipeline(
            &input,
            &[TransformOp::Aggregate {
                field: "v".into(),
                function: AggregateFn::Count,
            }],
        )
        .unwrap();
        assert_eq!(count, serde_json::json!(3));
    }

    #[test]
    fn shuffle_is_deterministic_with_seed() {
        let input = serde_json::json!([1, 2, 3, 4, 5]);
        let a = apply_pipeline(&input, &[TransformOp::Shuffle { seed: Some(7) }]).unwrap();
        let b = apply_pipeline(&input, &[TransformOp::Shuffle { seed: Some(7) }]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let input = serde_json::json!("not an array");
        let err = apply_pipeline(&input, &[TransformOp::First]).unwrap_err();
        assert!(matches!(err, Error::ExpectedArray { .. }));
    }

    #[test]
    fn group_by_without_aggregate_buckets_rows() {
        let input = serde_json::json!([{"tier": "gold", "v": 1}, {"tier": "silver", "v": 2}, {"tier": "gold", "v": 3}]);
        let result = apply_pipeline(&input, &[TransformOp::GroupBy { field: "tier".into(), aggregate: None }]).unwrap();
        assert_eq!(
            result,
            serde_json::json!({"gold": [{"tier": "gold", "v": 1}, {"tier": "gold", "v": 3}], "silver": [{"tier": "silver", "v": 2}]})
        );
    }

    #[test]
    fn group_by_with_aggregate_sums_each_group() {
        let input = serde_json::json!([{"tier": "gold", "v": 1}, {"tier": "silver", "v": 2}, {"tier": "gold", "v": 3}]);
        let result = apply_pipeline(
            &input,
            &[TransformOp::GroupBy {
                field: "tier".into(),
                aggregate: Some(GroupAggregate { field: "v".into(), function: AggregateFn::Sum }),
            }],
        )
        .unwrap();
        assert_eq!(result, serde_json::json!({"gold": 4.0, "silver": 2.0}));
    }

    #[test]
    fn inner_join_merges_matching_rows_only() {
        let left = serde_json::json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]);
        let right = vec![serde_json::json!({"ref": 1, "score": 10})];
        let result = apply_pipeline(
            &left,
            &[TransformOp::Join {
                left_key: "id".into(),
                right_key: "ref".into(),
                right_data: right,
                join_type: JoinType::Inner,
            }],
        )
        .unwrap();
        assert_eq!(result, serde_json::json!([{"id": 1, "name": "a", "ref": 1, "score": 10}]));
    }

    #[test]
    fn left_join_keeps_unmatched_left_rows() {
        let left = serde_json::json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]);
        let right = vec![serde_json::json!({"ref": 1, "score": 10})];
        let result = apply_pipeline(
            &left,
            &[TransformOp::Join {
                left_key: "id".into(),
                right_key: "ref".into(),
                right_data: right,
                join_type: JoinType::Left,
            }],
        )
        .unwrap();
        assert_eq!(result, serde_json::json!([{"id": 1, "name": "a", "ref": 1, "score": 10}, {"id": 2, "name": "b"}]));
    }

    #[test]
    fn string_join_concatenates_with_separator() {
        let input = serde_json::json!(["a", "b", "c"]);
        let result = apply_pipeline(&input, &[TransformOp::StringJoin { separator: "-".into() }]).unwrap();
        assert_eq!(result, serde_json::json!("a-b-c"));
    }

    #[test]
    fn template_op_resolves_against_item() {
        let input = serde_json::json!({"name": "alice"});
        let result = apply_pipeline(
            &input,
            &[TransformOp::Template {
                template: "hi {{input.name}}".into(),
            }],
        )
        .unwrap();
        assert_eq!(result, serde_json::json!("hi alice"));
    }
}
