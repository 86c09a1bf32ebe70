//! `$setWindowFields`: partition, sort, and compute output fields over
//! sliding windows.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::eval::{EvalCtx, date};
use crate::expr::{self, Expr};
use crate::path;
use crate::pipeline::SortSpec;
use crate::pipeline::group::{self, Accumulator};
use crate::value::{Document, Value};

#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub partition_by: Option<Expr>,
    pub sort_by: Option<SortSpec>,
    pub outputs: Vec<OutputField>,
}

#[derive(Debug, Clone)]
pub struct OutputField {
    pub path: Vec<String>,
    pub function: WindowFunction,
    pub bounds: Option<WindowBounds>,
}

#[derive(Debug, Clone)]
pub enum WindowFunction {
    Acc(Accumulator),
    Rank,
    DenseRank,
    RowNumber,
    Shift { output: Expr, by: i64, default: Option<Expr> },
    Derivative { input: Expr, unit: Option<i64> },
    Integral { input: Expr, unit: Option<i64> },
}

#[derive(Debug, Clone)]
pub enum WindowBounds {
    Documents(Bound, Bound),
    Range { lower: RangeBound, upper: RangeBound, unit: Option<i64> },
}

#[derive(Debug, Clone, Copy)]
pub enum Bound {
    Unbounded,
    Current,
    Offset(i64),
}

#[derive(Debug, Clone, Copy)]
pub enum RangeBound {
    Unbounded,
    Current,
    Delta(f64),
}

pub fn parse(spec: &Value) -> Result<WindowSpec> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$setWindowFields specification must be an object"));
    };
    let partition_by = match doc.get("partitionBy") {
        Some(p) => Some(expr::compile(p)?),
        None => None,
    };
    let sort_by = match doc.get("sortBy") {
        Some(s) => Some(SortSpec::parse(s)?),
        None => None,
    };
    let Some(Value::Object(output)) = doc.get("output") else {
        return Err(Error::bad_value("$setWindowFields requires an 'output' object"));
    };
    let mut outputs = Vec::with_capacity(output.len());
    for (field, field_spec) in output {
        outputs.push(parse_output_field(field, field_spec, sort_by.as_ref())?);
    }
    Ok(WindowSpec { partition_by, sort_by, outputs })
}

fn parse_output_field(
    field: &str,
    spec: &Value,
    sort_by: Option<&SortSpec>,
) -> Result<OutputField> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value(format!(
            "$setWindowFields output field '{}' must be an object",
            field
        )));
    };
    let mut function = None;
    let mut bounds = None;
    for (key, arg) in doc {
        match key.as_str() {
            "window" => bounds = Some(parse_bounds(arg)?),
            "$rank" | "$denseRank" | "$rowNumber" => {
                function = Some(match key.as_str() {
                    "$rank" => WindowFunction::Rank,
                    "$denseRank" => WindowFunction::DenseRank,
                    _ => WindowFunction::RowNumber,
                });
            }
            "$shift" => {
                let Value::Object(shift) = arg else {
                    return Err(Error::bad_value("$shift requires an object argument"));
                };
                let output = shift
                    .get("output")
                    .ok_or_else(|| Error::bad_value("$shift requires 'output'"))?;
                let by = shift
                    .get("by")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| Error::bad_value("$shift requires an integer 'by'"))?;
                let default = match shift.get("default") {
                    Some(d) => Some(expr::compile(d)?),
                    None => None,
                };
                function = Some(WindowFunction::Shift {
                    output: expr::compile(output)?,
                    by,
                    default,
                });
            }
            "$derivative" | "$integral" => {
                let Value::Object(options) = arg else {
                    return Err(Error::bad_value(format!("{} requires an object argument", key)));
                };
                let input = options
                    .get("input")
                    .ok_or_else(|| Error::bad_value(format!("{} requires 'input'", key)))?;
                let unit = match options.get("unit") {
                    Some(Value::String(u)) => Some(date::unit_millis(u).ok_or_else(|| {
                        Error::bad_value(format!("{} found an unknown unit: {}", key, u))
                    })?),
                    Some(_) => {
                        return Err(Error::bad_value(format!("{} 'unit' must be a string", key)));
                    }
                    None => None,
                };
                let input = expr::compile(input)?;
                function = Some(if key == "$derivative" {
                    WindowFunction::Derivative { input, unit }
                } else {
                    WindowFunction::Integral { input, unit }
                });
            }
            op if op.starts_with('$') => {
                function = Some(WindowFunction::Acc(Accumulator::parse(op, arg)?));
            }
            other => {
                return Err(Error::bad_value(format!(
                    "unknown option '{}' in $setWindowFields output field '{}'",
                    other, field
                )));
            }
        }
    }
    let Some(function) = function else {
        return Err(Error::bad_value(format!(
            "$setWindowFields output field '{}' must name a window function",
            field
        )));
    };
    let needs_sort = matches!(
        function,
        WindowFunction::Rank
            | WindowFunction::DenseRank
            | WindowFunction::RowNumber
            | WindowFunction::Shift { .. }
            | WindowFunction::Derivative { .. }
            | WindowFunction::Integral { .. }
    ) || bounds.is_some();
    if needs_sort && sort_by.is_none() {
        return Err(Error::bad_value(format!(
            "$setWindowFields output field '{}' requires a 'sortBy'",
            field
        )));
    }
    if bounds.is_some()
        && matches!(
            function,
            WindowFunction::Rank
                | WindowFunction::DenseRank
                | WindowFunction::RowNumber
                | WindowFunction::Shift { .. }
        )
    {
        return Err(Error::bad_value(format!(
            "window function in output field '{}' does not accept a 'window'",
            field
        )));
    }
    Ok(OutputField {
        path: path::split(field),
        function,
        bounds,
    })
}

fn parse_bounds(spec: &Value) -> Result<WindowBounds> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("'window' must be an object"));
    };
    if let Some(Value::Array(pair)) = doc.get("documents") {
        if pair.len() != 2 {
            return Err(Error::bad_value("'documents' window must be a [lower, upper] pair"));
        }
        let bound = |v: &Value| -> Result<Bound> {
            match v {
                Value::String(s) if s == "unbounded" => Ok(Bound::Unbounded),
                Value::String(s) if s == "current" => Ok(Bound::Current),
                other => other
                    .as_i64()
                    .map(Bound::Offset)
                    .ok_or_else(|| {
                        Error::bad_value(
                            "'documents' bounds must be 'unbounded', 'current' or an integer",
                        )
                    }),
            }
        };
        return Ok(WindowBounds::Documents(bound(&pair[0])?, bound(&pair[1])?));
    }
    if let Some(Value::Array(pair)) = doc.get("range") {
        if pair.len() != 2 {
            return Err(Error::bad_value("'range' window must be a [lower, upper] pair"));
        }
        let bound = |v: &Value| -> Result<RangeBound> {
            match v {
                Value::String(s) if s == "unbounded" => Ok(RangeBound::Unbounded),
                Value::String(s) if s == "current" => Ok(RangeBound::Current),
                other => other
                    .as_f64()
                    .map(RangeBound::Delta)
                    .ok_or_else(|| {
                        Error::bad_value(
                            "'range' bounds must be 'unbounded', 'current' or a number",
                        )
                    }),
            }
        };
        let unit = match doc.get("unit") {
            Some(Value::String(u)) => Some(date::unit_millis(u).ok_or_else(|| {
                Error::bad_value(format!("'range' window found an unknown unit: {}", u))
            })?),
            Some(_) => return Err(Error::bad_value("'range' window 'unit' must be a string")),
            None => None,
        };
        return Ok(WindowBounds::Range {
            lower: bound(&pair[0])?,
            upper: bound(&pair[1])?,
            unit,
        });
    }
    Err(Error::bad_value("'window' requires 'documents' or 'range' bounds"))
}

pub fn run(spec: &WindowSpec, docs: Vec<Document>, ctx: &EvalCtx) -> Result<Vec<Document>> {
    // Partition in first-arrival order.
    let mut partitions: IndexMap<String, Vec<Document>> = IndexMap::new();
    for doc in docs {
        let key = match &spec.partition_by {
            Some(partition_expr) => {
                let value = ctx.eval_on(partition_expr, Value::Object(doc.clone()))?;
                group::group_key(&value)
            }
            None => String::new(),
        };
        partitions.entry(key).or_default().push(doc);
    }
    let mut out = Vec::new();
    for (_, mut partition) in partitions {
        if let Some(sort) = &spec.sort_by {
            partition.sort_by(|a, b| sort.compare(a, b));
        }
        let results = run_partition(spec, &partition, ctx)?;
        out.extend(results);
    }
    Ok(out)
}

fn run_partition(
    spec: &WindowSpec,
    partition: &[Document],
    ctx: &EvalCtx,
) -> Result<Vec<Document>> {
    let n = partition.len();
    let mut outputs: Vec<Vec<Value>> = Vec::with_capacity(spec.outputs.len());
    for field in &spec.outputs {
        let values = compute_field(field, spec, partition, ctx)?;
        outputs.push(values);
    }
    let mut out = Vec::with_capacity(n);
    for (i, doc) in partition.iter().enumerate() {
        let mut doc = doc.clone();
        for (field, values) in spec.outputs.iter().zip(&outputs) {
            if !values[i].is_missing() {
                path::set_path(&mut doc, &field.path, values[i].clone());
            }
        }
        out.push(doc);
    }
    Ok(out)
}

/// The first sortBy key of each document as a number (dates as epoch
/// millis), for range windows and derivatives.
fn sort_key_numbers(
    spec: &WindowSpec,
    partition: &[Document],
    field: &str,
) -> Result<Vec<f64>> {
    let sort = spec
        .sort_by
        .as_ref()
        .expect("sortBy validated during parse");
    let (segments, _) = &sort.keys[0];
    partition
        .iter()
        .map(|doc| {
            let value = path::resolve_for_sort(&Value::Object(doc.clone()), segments);
            match value {
                Value::Date(ms) => Ok(ms as f64),
                v => v.as_f64().ok_or_else(|| {
                    Error::bad_value(format!(
                        "window function '{}' requires a numeric or date sortBy value",
                        field
                    ))
                }),
            }
        })
        .collect()
}

fn compute_field(
    field: &OutputField,
    spec: &WindowSpec,
    partition: &[Document],
    ctx: &EvalCtx,
) -> Result<Vec<Value>> {
    let n = partition.len();
    match &field.function {
        WindowFunction::RowNumber => {
            Ok((0..n).map(|i| Value::from_int(i as i64 + 1)).collect())
        }
        WindowFunction::Rank | WindowFunction::DenseRank => {
            let sort = spec.sort_by.as_ref().expect("sortBy validated during parse");
            let dense = matches!(field.function, WindowFunction::DenseRank);
            let mut ranks = Vec::with_capacity(n);
            let mut current = 0i64;
            for i in 0..n {
                if i == 0 {
                    current = 1;
                } else if sort.compare(&partition[i - 1], &partition[i])
                    != std::cmp::Ordering::Equal
                {
                    current = if dense { current + 1 } else { i as i64 + 1 };
                }
                ranks.push(Value::from_int(current));
            }
            Ok(ranks)
        }
        WindowFunction::Shift { output, by, default } => {
            let mut values = Vec::with_capacity(n);
            for doc in partition {
                let value = ctx.eval_on(output, Value::Object(doc.clone()))?;
                values.push(if value.is_missing() { Value::Null } else { value });
            }
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let j = i as i64 + by;
                if (0..n as i64).contains(&j) {
                    out.push(values[j as usize].clone());
                } else {
                    match default {
                        Some(default_expr) => {
                            let value = ctx
                                .eval_on(default_expr, Value::Object(partition[i].clone()))?;
                            out.push(if value.is_missing() { Value::Null } else { value });
                        }
                        None => out.push(Value::Null),
                    }
                }
            }
            Ok(out)
        }
        WindowFunction::Acc(acc) => {
            let mut inputs = Vec::with_capacity(n);
            for doc in partition {
                let value = match group::accumulator_input(acc) {
                    Some(input) => ctx.eval_on(input, Value::Object(doc.clone()))?,
                    None => Value::Null,
                };
                inputs.push(value);
            }
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (lo, hi) = window_slice(field, spec, partition, i)?;
                out.push(group::fold_slice(acc, &inputs[lo..hi])?);
            }
            Ok(out)
        }
        WindowFunction::Derivative { input, unit } => {
            let inputs = numeric_inputs(input, partition, ctx)?;
            let keys = sort_key_numbers(spec, partition, "$derivative")?;
            let scale = unit.unwrap_or(1) as f64;
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (lo, hi) = window_slice(field, spec, partition, i)?;
                if hi - lo < 2 {
                    out.push(Value::Null);
                    continue;
                }
                let (Some(v0), Some(v1)) = (inputs[lo], inputs[hi - 1]) else {
                    out.push(Value::Null);
                    continue;
                };
                let dt = (keys[hi - 1] - keys[lo]) / scale;
                if dt == 0.0 {
                    out.push(Value::Null);
                } else {
                    out.push(Value::Double((v1 - v0) / dt));
                }
            }
            Ok(out)
        }
        WindowFunction::Integral { input, unit } => {
            let inputs = numeric_inputs(input, partition, ctx)?;
            let keys = sort_key_numbers(spec, partition, "$integral")?;
            let scale = unit.unwrap_or(1) as f64;
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (lo, hi) = window_slice(field, spec, partition, i)?;
                let mut total = 0.0;
                let mut complete = hi > lo;
                for j in lo..hi.saturating_sub(1) {
                    let (Some(a), Some(b)) = (inputs[j], inputs[j + 1]) else {
                        complete = false;
                        break;
                    };
                    total += (a + b) / 2.0 * ((keys[j + 1] - keys[j]) / scale);
                }
                out.push(if complete { Value::Double(total) } else { Value::Null });
            }
            Ok(out)
        }
    }
}

fn numeric_inputs(
    input: &Expr,
    partition: &[Document],
    ctx: &EvalCtx,
) -> Result<Vec<Option<f64>>> {
    partition
        .iter()
        .map(|doc| {
            let value = ctx.eval_on(input, Value::Object(doc.clone()))?;
            Ok(match value {
                Value::Date(ms) => Some(ms as f64),
                v => v.as_f64(),
            })
        })
        .collect()
}

/// Resolve an output field's window to a `[lo, hi)` slice of the sorted
/// partition for document `i`. No window means the whole partition.
fn window_slice(
    field: &OutputField,
    spec: &WindowSpec,
    partition: &[Document],
    i: usize,
) -> Result<(usize, usize)> {
    let n = partition.len();
    let Some(bounds) = &field.bounds else {
        return Ok((0, n));
    };
    match bounds {
        WindowBounds::Documents(lower, upper) => {
            let clamp = |x: i64| x.clamp(0, n as i64) as usize;
            let lo = match lower {
                Bound::Unbounded => 0,
                Bound::Current => i,
                Bound::Offset(k) => clamp(i as i64 + k),
            };
            let hi = match upper {
                Bound::Unbounded => n,
                Bound::Current => i + 1,
                Bound::Offset(k) => clamp(i as i64 + k + 1),
            };
            Ok((lo.min(hi), hi))
        }
        WindowBounds::Range { lower, upper, unit } => {
            let keys = sort_key_numbers(spec, partition, "range window")?;
            let center = keys[i];
            let scale = unit.unwrap_or(1) as f64;
            let in_lower = |j: usize| match lower {
                RangeBound::Unbounded => true,
                RangeBound::Current => keys[j] >= center,
                RangeBound::Delta(d) => keys[j] >= center + d * scale,
            };
            let in_upper = |j: usize| match upper {
                RangeBound::Unbounded => true,
                RangeBound::Current => keys[j] <= center,
                RangeBound::Delta(d) => keys[j] <= center + d * scale,
            };
            let mut lo = n;
            let mut hi = 0;
            for j in 0..n {
                if in_lower(j) && in_upper(j) {
                    lo = lo.min(j);
                    hi = hi.max(j + 1);
                }
            }
            if lo > hi {
                Ok((0, 0))
            } else {
                Ok((lo, hi))
            }
        }
    }
}
