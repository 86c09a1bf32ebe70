//! `$group` and its relatives. Groups are keyed by a canonical encoding
//! of the `_id` value (numbers collapse across subtypes) and emitted in
//! first-arrival order unless the stage itself sorts.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::eval::{EvalCtx, arith, array};
use crate::expr::{self, Expr};
use crate::value::{Document, Value};

/// An accumulator as written in a `$group` or window output field.
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Push(Expr),
    AddToSet(Expr),
    MergeObjects(Expr),
    StdDevPop(Expr),
    StdDevSamp(Expr),
    Count,
}

impl Accumulator {
    pub fn parse(op: &str, arg: &Value) -> Result<Accumulator> {
        Ok(match op {
            "$sum" => Accumulator::Sum(expr::compile(arg)?),
            "$avg" => Accumulator::Avg(expr::compile(arg)?),
            "$min" => Accumulator::Min(expr::compile(arg)?),
            "$max" => Accumulator::Max(expr::compile(arg)?),
            "$first" => Accumulator::First(expr::compile(arg)?),
            "$last" => Accumulator::Last(expr::compile(arg)?),
            "$push" => Accumulator::Push(expr::compile(arg)?),
            "$addToSet" => Accumulator::AddToSet(expr::compile(arg)?),
            "$mergeObjects" => Accumulator::MergeObjects(expr::compile(arg)?),
            "$stdDevPop" => Accumulator::StdDevPop(expr::compile(arg)?),
            "$stdDevSamp" => Accumulator::StdDevSamp(expr::compile(arg)?),
            "$count" => {
                match arg {
                    Value::Object(options) if options.is_empty() => {}
                    _ => {
                        return Err(Error::bad_value("$count takes no arguments (use {})"));
                    }
                }
                Accumulator::Count
            }
            other => {
                return Err(Error::bad_value(format!(
                    "unknown group operator '{}'",
                    other
                )));
            }
        })
    }

    fn input(&self) -> Option<&Expr> {
        match self {
            Accumulator::Sum(e)
            | Accumulator::Avg(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e)
            | Accumulator::Last(e)
            | Accumulator::Push(e)
            | Accumulator::AddToSet(e)
            | Accumulator::MergeObjects(e)
            | Accumulator::StdDevPop(e)
            | Accumulator::StdDevSamp(e) => Some(e),
            Accumulator::Count => None,
        }
    }

    fn init(&self) -> AccState {
        match self {
            Accumulator::Sum(_) => AccState::Sum(Value::Int(0)),
            Accumulator::Avg(_) => AccState::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) | Accumulator::Max(_) => AccState::MinMax(None),
            Accumulator::First(_) => AccState::First(None),
            Accumulator::Last(_) => AccState::Last(Value::Missing),
            Accumulator::Push(_) => AccState::Items(Vec::new()),
            Accumulator::AddToSet(_) => AccState::Set(Vec::new()),
            Accumulator::MergeObjects(_) => AccState::Merged(Document::new()),
            Accumulator::StdDevPop(_) | Accumulator::StdDevSamp(_) => {
                AccState::Numbers(Vec::new())
            }
            Accumulator::Count => AccState::Counter(0),
        }
    }

    /// Fold one evaluated input value into the state, in arrival order.
    fn fold(&self, state: &mut AccState, value: Value) -> Result<()> {
        match (self, state) {
            (Accumulator::Sum(_), AccState::Sum(acc)) => {
                if value.is_number() {
                    *acc = arith::add_pair(acc, &value);
                }
            }
            (Accumulator::Avg(_), AccState::Avg { sum, count }) => {
                if let Some(n) = value.as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            (Accumulator::Min(_), AccState::MinMax(best)) => {
                if !value.is_nullish() {
                    let better = best.as_ref().is_none_or(|b| value.compare(b).is_lt());
                    if better {
                        *best = Some(value);
                    }
                }
            }
            (Accumulator::Max(_), AccState::MinMax(best)) => {
                if !value.is_nullish() {
                    let better = best.as_ref().is_none_or(|b| value.compare(b).is_gt());
                    if better {
                        *best = Some(value);
                    }
                }
            }
            (Accumulator::First(_), AccState::First(slot)) => {
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
            (Accumulator::Last(_), AccState::Last(slot)) => *slot = value,
            (Accumulator::Push(_), AccState::Items(items)) => {
                if !value.is_missing() {
                    items.push(value);
                }
            }
            (Accumulator::AddToSet(_), AccState::Set(items)) => {
                if !value.is_missing() && !items.contains(&value) {
                    items.push(value);
                }
            }
            (Accumulator::MergeObjects(_), AccState::Merged(doc)) => match value {
                Value::Null | Value::Missing => {}
                Value::Object(incoming) => {
                    for (k, v) in incoming {
                        doc.insert(k, v);
                    }
                }
                other => {
                    return Err(Error::type_mismatch(format!(
                        "$mergeObjects requires object inputs, but input is of type {}",
                        other.type_name()
                    )));
                }
            },
            (Accumulator::StdDevPop(_) | Accumulator::StdDevSamp(_), AccState::Numbers(ns)) => {
                if let Some(n) = value.as_f64() {
                    ns.push(n);
                }
            }
            (Accumulator::Count, AccState::Counter(n)) => *n += 1,
            _ => unreachable!("accumulator state mismatch"),
        }
        Ok(())
    }

    fn finish(&self, state: AccState) -> Value {
        match (self, state) {
            (_, AccState::Sum(acc)) => acc,
            (_, AccState::Avg { sum, count }) => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Double(sum / count as f64)
                }
            }
            (_, AccState::MinMax(best)) => best.unwrap_or(Value::Null),
            (_, AccState::First(slot)) => slot.unwrap_or(Value::Missing),
            (_, AccState::Last(slot)) => slot,
            (_, AccState::Items(items) | AccState::Set(items)) => Value::Array(items),
            (_, AccState::Merged(doc)) => Value::Object(doc),
            (acc, AccState::Numbers(ns)) => {
                let values: Vec<Value> = ns.into_iter().map(Value::Double).collect();
                array::std_dev(&values, matches!(acc, Accumulator::StdDevSamp(_)))
            }
            (_, AccState::Counter(n)) => Value::from_int(n as i64),
        }
    }
}

#[derive(Debug, Clone)]
enum AccState {
    Sum(Value),
    Avg { sum: f64, count: u64 },
    MinMax(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Items(Vec<Value>),
    Set(Vec<Value>),
    Merged(Document),
    Numbers(Vec<f64>),
    Counter(u64),
}

/// Fold an accumulator over a precomputed slice of input values — the
/// window-function path.
pub(crate) fn fold_slice(acc: &Accumulator, values: &[Value]) -> Result<Value> {
    let mut state = acc.init();
    for value in values {
        acc.fold(&mut state, value.clone())?;
    }
    Ok(acc.finish(state))
}

pub(crate) fn accumulator_input(acc: &Accumulator) -> Option<&Expr> {
    acc.input()
}

// ========================================
// $group
// ========================================

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: Expr,
    pub fields: Vec<(String, Accumulator)>,
}

pub fn parse_group(spec: &Value) -> Result<GroupSpec> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$group specification must be an object"));
    };
    let id = doc
        .get("_id")
        .ok_or_else(|| Error::bad_value("a group specification must include an _id"))?;
    let id = expr::compile(id)?;
    let mut fields = Vec::with_capacity(doc.len().saturating_sub(1));
    for (field, acc_spec) in doc {
        if field == "_id" {
            continue;
        }
        if field.contains('.') {
            return Err(Error::bad_value(format!(
                "the group field '{}' cannot contain '.'",
                field
            )));
        }
        let Value::Object(acc_doc) = acc_spec else {
            return Err(Error::bad_value(format!(
                "the field '{}' must be an accumulator object",
                field
            )));
        };
        if acc_doc.len() != 1 {
            return Err(Error::bad_value(format!(
                "the field '{}' must specify one accumulator",
                field
            )));
        }
        let (op, arg) = acc_doc.iter().next().unwrap();
        fields.push((field.clone(), Accumulator::parse(op, arg)?));
    }
    Ok(GroupSpec { id, fields })
}

pub fn run_group(spec: &GroupSpec, docs: &[Document], ctx: &EvalCtx) -> Result<Vec<Document>> {
    let mut table: IndexMap<String, (Value, Vec<AccState>)> = IndexMap::new();
    for doc in docs {
        let current = Value::Object(doc.clone());
        let id = match ctx.eval_on(&spec.id, current.clone())? {
            Value::Missing => Value::Null,
            v => v,
        };
        let key = group_key(&id);
        let entry = table.entry(key).or_insert_with(|| {
            (id, spec.fields.iter().map(|(_, acc)| acc.init()).collect())
        });
        for ((_, acc), state) in spec.fields.iter().zip(entry.1.iter_mut()) {
            let value = match acc.input() {
                Some(input) => ctx.eval_on(input, current.clone())?,
                None => Value::Null,
            };
            acc.fold(state, value)?;
        }
    }
    let mut out = Vec::with_capacity(table.len());
    for (_, (id, states)) in table {
        let mut doc = Document::new();
        doc.insert("_id".to_string(), id);
        for ((field, acc), state) in spec.fields.iter().zip(states) {
            let value = acc.finish(state);
            if !value.is_missing() {
                doc.insert(field.clone(), value);
            }
        }
        out.push(doc);
    }
    Ok(out)
}

/// A canonical key for grouping: numeric subtypes collapse, everything
/// else keys by tag plus content.
pub(crate) fn group_key(value: &Value) -> String {
    let mut out = String::new();
    write_key(value, &mut out);
    out
}

fn write_key(value: &Value, out: &mut String) {
    match value {
        Value::Missing | Value::Null => out.push('z'),
        v @ (Value::Int(_) | Value::Long(_) | Value::Double(_) | Value::Decimal(_)) => {
            if let Some(n) = v.as_i64() {
                out.push('i');
                out.push_str(&n.to_string());
            } else {
                let n = v.as_f64().unwrap_or(f64::NAN);
                out.push('f');
                out.push_str(&n.to_bits().to_string());
            }
        }
        Value::String(s) => {
            out.push('s');
            out.push_str(&s.len().to_string());
            out.push(':');
            out.push_str(s);
        }
        Value::Bool(b) => out.push_str(if *b { "T" } else { "F" }),
        Value::Date(ms) => {
            out.push('d');
            out.push_str(&ms.to_string());
        }
        Value::Binary(bytes) => {
            out.push('b');
            for byte in bytes {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        Value::Regex { pattern, options } => {
            out.push('r');
            out.push_str(pattern);
            out.push('/');
            out.push_str(options);
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_key(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::Object(doc) => {
            out.push('{');
            for (k, v) in doc {
                out.push_str(&k.len().to_string());
                out.push(':');
                out.push_str(k);
                out.push('=');
                write_key(v, out);
                out.push(',');
            }
            out.push('}');
        }
    }
}

// ========================================
// $sortByCount
// ========================================

pub fn run_sort_by_count(by: &Expr, docs: &[Document], ctx: &EvalCtx) -> Result<Vec<Document>> {
    let spec = GroupSpec {
        id: by.clone(),
        fields: vec![(
            "count".to_string(),
            Accumulator::Sum(Expr::Literal(Value::Int(1))),
        )],
    };
    let mut grouped = run_group(&spec, docs, ctx)?;
    grouped.sort_by(|a, b| {
        let ca = a.get("count").cloned().unwrap_or(Value::Int(0));
        let cb = b.get("count").cloned().unwrap_or(Value::Int(0));
        cb.compare(&ca)
    });
    Ok(grouped)
}

// ========================================
// $bucket / $bucketAuto
// ========================================

#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub group_by: Expr,
    pub boundaries: Vec<Value>,
    pub default: Option<Value>,
    pub output: Vec<(String, Accumulator)>,
}

fn parse_output(spec: Option<&Value>) -> Result<Vec<(String, Accumulator)>> {
    let Some(spec) = spec else {
        return Ok(vec![(
            "count".to_string(),
            Accumulator::Sum(Expr::Literal(Value::Int(1))),
        )]);
    };
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("'output' must be an object of accumulators"));
    };
    let mut fields = Vec::with_capacity(doc.len());
    for (field, acc_spec) in doc {
        let Value::Object(acc_doc) = acc_spec else {
            return Err(Error::bad_value(format!(
                "the output field '{}' must be an accumulator object",
                field
            )));
        };
        if acc_doc.len() != 1 {
            return Err(Error::bad_value(format!(
                "the output field '{}' must specify one accumulator",
                field
            )));
        }
        let (op, arg) = acc_doc.iter().next().unwrap();
        fields.push((field.clone(), Accumulator::parse(op, arg)?));
    }
    Ok(fields)
}

pub fn parse_bucket(spec: &Value) -> Result<BucketSpec> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$bucket specification must be an object"));
    };
    let group_by = doc
        .get("groupBy")
        .ok_or_else(|| Error::bad_value("$bucket requires 'groupBy'"))?;
    let Some(Value::Array(boundaries)) = doc.get("boundaries") else {
        return Err(Error::bad_value("$bucket requires a 'boundaries' array"));
    };
    if boundaries.len() < 2 {
        return Err(Error::bad_value(
            "$bucket 'boundaries' must have at least 2 elements",
        ));
    }
    let rank = boundaries[0].type_rank();
    for pair in boundaries.windows(2) {
        if pair[1].type_rank() != rank {
            return Err(Error::bad_value(
                "$bucket 'boundaries' must all have the same type",
            ));
        }
        if pair[0].compare(&pair[1]).is_ge() {
            return Err(Error::bad_value(
                "$bucket 'boundaries' must be strictly increasing",
            ));
        }
    }
    Ok(BucketSpec {
        group_by: expr::compile(group_by)?,
        boundaries: boundaries.clone(),
        default: doc.get("default").cloned(),
        output: parse_output(doc.get("output"))?,
    })
}

pub fn run_bucket(spec: &BucketSpec, docs: &[Document], ctx: &EvalCtx) -> Result<Vec<Document>> {
    // bucket index (or usize::MAX for the default bucket) -> states
    let mut table: IndexMap<usize, Vec<AccState>> = IndexMap::new();
    const DEFAULT: usize = usize::MAX;
    for doc in docs {
        let current = Value::Object(doc.clone());
        let value = ctx.eval_on(&spec.group_by, current.clone())?;
        let rank_matches = value.type_rank() == spec.boundaries[0].type_rank();
        let mut slot = None;
        if rank_matches {
            for i in 0..spec.boundaries.len() - 1 {
                if value.compare(&spec.boundaries[i]).is_ge()
                    && value.compare(&spec.boundaries[i + 1]).is_lt()
                {
                    slot = Some(i);
                    break;
                }
            }
        }
        let slot = match slot {
            Some(i) => i,
            None => {
                if spec.default.is_none() {
                    return Err(Error::bad_value(
                        "$bucket could not find a bucket for a value, \
                         and no 'default' was specified",
                    ));
                }
                DEFAULT
            }
        };
        let states = table
            .entry(slot)
            .or_insert_with(|| spec.output.iter().map(|(_, acc)| acc.init()).collect());
        fold_output(&spec.output, states, &current, ctx)?;
    }
    let mut out = Vec::with_capacity(table.len());
    for (slot, states) in table {
        let id = if slot == DEFAULT {
            spec.default.clone().expect("default checked during fold")
        } else {
            spec.boundaries[slot].clone()
        };
        out.push(finish_bucket(id, &spec.output, states));
    }
    out.sort_by(|a, b| {
        let ia = a.get("_id").cloned().unwrap_or(Value::Null);
        let ib = b.get("_id").cloned().unwrap_or(Value::Null);
        ia.compare(&ib)
    });
    Ok(out)
}

fn fold_output(
    output: &[(String, Accumulator)],
    states: &mut [AccState],
    current: &Value,
    ctx: &EvalCtx,
) -> Result<()> {
    for ((_, acc), state) in output.iter().zip(states.iter_mut()) {
        let value = match acc.input() {
            Some(input) => ctx.eval_on(input, current.clone())?,
            None => Value::Null,
        };
        acc.fold(state, value)?;
    }
    Ok(())
}

fn finish_bucket(id: Value, output: &[(String, Accumulator)], states: Vec<AccState>) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".to_string(), id);
    for ((field, acc), state) in output.iter().zip(states) {
        let value = acc.finish(state);
        if !value.is_missing() {
            doc.insert(field.clone(), value);
        }
    }
    doc
}

#[derive(Debug, Clone)]
pub struct BucketAutoSpec {
    pub group_by: Expr,
    pub buckets: usize,
    pub output: Vec<(String, Accumulator)>,
}

pub fn parse_bucket_auto(spec: &Value) -> Result<BucketAutoSpec> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$bucketAuto specification must be an object"));
    };
    let group_by = doc
        .get("groupBy")
        .ok_or_else(|| Error::bad_value("$bucketAuto requires 'groupBy'"))?;
    let buckets = doc
        .get("buckets")
        .and_then(|v| v.as_i64())
        .filter(|n| *n >= 1)
        .ok_or_else(|| Error::bad_value("$bucketAuto requires a positive integer 'buckets'"))?;
    Ok(BucketAutoSpec {
        group_by: expr::compile(group_by)?,
        buckets: buckets as usize,
        output: parse_output(doc.get("output"))?,
    })
}

pub fn run_bucket_auto(
    spec: &BucketAutoSpec,
    docs: &[Document],
    ctx: &EvalCtx,
) -> Result<Vec<Document>> {
    if docs.is_empty() {
        return Ok(Vec::new());
    }
    let mut keyed: Vec<(Value, &Document)> = Vec::with_capacity(docs.len());
    for doc in docs {
        let value = ctx.eval_on(&spec.group_by, Value::Object(doc.clone()))?;
        keyed.push((value, doc));
    }
    keyed.sort_by(|(a, _), (b, _)| a.compare(b));

    let per_bucket = keyed.len().div_ceil(spec.buckets);
    let mut out = Vec::new();
    let mut start = 0;
    while start < keyed.len() {
        let mut end = (start + per_bucket).min(keyed.len());
        // Equal grouping values never split across buckets.
        while end < keyed.len() && keyed[end].0 == keyed[end - 1].0 {
            end += 1;
        }
        let min = keyed[start].0.clone();
        let max = if end < keyed.len() {
            keyed[end].0.clone()
        } else {
            keyed[keyed.len() - 1].0.clone()
        };
        let mut states: Vec<AccState> = spec.output.iter().map(|(_, acc)| acc.init()).collect();
        for (_, doc) in &keyed[start..end] {
            fold_output(&spec.output, &mut states, &Value::Object((*doc).clone()), ctx)?;
        }
        let mut id = Document::new();
        id.insert("min".to_string(), min);
        id.insert("max".to_string(), max);
        out.push(finish_bucket(Value::Object(id), &spec.output, states));
        start = end;
    }
    Ok(out)
}
