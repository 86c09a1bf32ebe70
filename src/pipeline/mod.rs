//! The pipeline runtime: stage parsing with up-front structural
//! validation, and stage-by-stage execution over the document stream.
//!
//! Streaming stages preserve the relative order of surviving documents;
//! blocking stages (`$sort`, `$group`, `$bucket`, `$bucketAuto`, `$facet`,
//! `$setWindowFields`) buffer their full input before emitting.

pub mod group;
pub mod lookup;
pub mod merge;
pub mod window;

use log::trace;

use crate::collection::Database;
use crate::error::{Error, Result};
use crate::eval::EvalCtx;
use crate::expr::{self, Expr};
use crate::matcher::{self, Predicate};
use crate::path;
use crate::projection::{self, AddFields, Projection};
use crate::value::{Document, Value};

/// A parsed pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Predicate),
    Project(Projection),
    AddFields(AddFields),
    Unset(Vec<Vec<String>>),
    ReplaceRoot(Expr),
    Sort(SortSpec),
    Limit(u64),
    Skip(u64),
    Count(String),
    Unwind {
        path: Vec<String>,
        include_array_index: Option<String>,
        preserve_null_and_empty: bool,
    },
    Group(group::GroupSpec),
    SortByCount(Expr),
    Sample { size: u64 },
    Bucket(group::BucketSpec),
    BucketAuto(group::BucketAutoSpec),
    Facet(Vec<(String, Vec<Stage>)>),
    Lookup(lookup::LookupSpec),
    UnionWith { coll: String, pipeline: Vec<Stage> },
    SetWindowFields(window::WindowSpec),
    Merge(merge::MergeSpec),
    Out(String),
}

/// A compound sort key: dotted paths with a direction each. Shared with
/// cursor sorting.
#[derive(Debug, Clone)]
pub struct SortSpec {
    pub keys: Vec<(Vec<String>, i8)>,
}

impl SortSpec {
    pub fn parse(spec: &Value) -> Result<SortSpec> {
        let Value::Object(doc) = spec else {
            return Err(Error::bad_value("$sort specification must be an object"));
        };
        if doc.is_empty() {
            return Err(Error::bad_value("$sort requires at least one sort key"));
        }
        let mut keys = Vec::with_capacity(doc.len());
        for (field, direction) in doc {
            let direction = match direction.as_i64() {
                Some(1) => 1,
                Some(-1) => -1,
                _ => {
                    return Err(Error::bad_value(format!(
                        "Illegal key in $sort specification: {} must be 1 or -1",
                        field
                    )));
                }
            };
            keys.push((path::split(field), direction));
        }
        Ok(SortSpec { keys })
    }

    /// Stable comparison of two documents under this key. Missing sort
    /// keys rank as Null.
    pub fn compare(&self, a: &Document, b: &Document) -> std::cmp::Ordering {
        let (va, vb) = (Value::Object(a.clone()), Value::Object(b.clone()));
        for (segments, direction) in &self.keys {
            let ka = path::resolve_for_sort(&va, segments);
            let kb = path::resolve_for_sort(&vb, segments);
            let ord = ka.compare(&kb);
            if ord != std::cmp::Ordering::Equal {
                return if *direction < 0 { ord.reverse() } else { ord };
            }
        }
        std::cmp::Ordering::Equal
    }
}

/// Parse a pipeline: each stage is an object with exactly one
/// operator-keyed field, and `$out`/`$merge` may only terminate the
/// pipeline.
pub fn parse(stages: &[Value]) -> Result<Vec<Stage>> {
    let mut parsed = Vec::with_capacity(stages.len());
    for (index, spec) in stages.iter().enumerate() {
        let stage = parse_stage(spec)?;
        if matches!(stage, Stage::Out(_) | Stage::Merge(_)) && index != stages.len() - 1 {
            let name = if matches!(stage, Stage::Out(_)) { "$out" } else { "$merge" };
            return Err(Error::bad_value(format!(
                "{} can only be the final stage in the pipeline",
                name
            )));
        }
        parsed.push(stage);
    }
    Ok(parsed)
}

fn parse_stage(spec: &Value) -> Result<Stage> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("each pipeline stage must be an object"));
    };
    if doc.len() != 1 {
        return Err(Error::bad_value(
            "A pipeline stage specification object must contain exactly one field",
        ));
    }
    let (name, arg) = doc.iter().next().unwrap();
    trace!("parsing pipeline stage {}", name);
    match name.as_str() {
        "$match" => Ok(Stage::Match(matcher::compile(arg)?)),
        "$project" => Ok(Stage::Project(projection::compile(arg)?)),
        "$addFields" | "$set" => Ok(Stage::AddFields(projection::compile_add_fields(arg)?)),
        "$unset" => {
            let fields = match arg {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s.clone()),
                        _ => Err(Error::bad_value("$unset requires string field paths")),
                    })
                    .collect::<Result<Vec<String>>>()?,
                _ => {
                    return Err(Error::bad_value(
                        "$unset requires a string or an array of strings",
                    ));
                }
            };
            if fields.is_empty() {
                return Err(Error::bad_value("$unset requires at least one field"));
            }
            Ok(Stage::Unset(fields.iter().map(|f| path::split(f)).collect()))
        }
        "$replaceRoot" => {
            let Value::Object(options) = arg else {
                return Err(Error::bad_value("$replaceRoot requires an object argument"));
            };
            let new_root = options
                .get("newRoot")
                .ok_or_else(|| Error::bad_value("$replaceRoot requires a 'newRoot' expression"))?;
            Ok(Stage::ReplaceRoot(expr::compile(new_root)?))
        }
        "$replaceWith" => Ok(Stage::ReplaceRoot(expr::compile(arg)?)),
        "$sort" => Ok(Stage::Sort(SortSpec::parse(arg)?)),
        "$limit" => Ok(Stage::Limit(non_negative(arg, "$limit")?)),
        "$skip" => Ok(Stage::Skip(non_negative(arg, "$skip")?)),
        "$count" => {
            let Value::String(field) = arg else {
                return Err(Error::bad_value("$count requires a string field name"));
            };
            if field.is_empty() {
                return Err(Error::bad_value("$count field name must be non-empty"));
            }
            if field.starts_with('$') || field.contains('.') {
                return Err(Error::bad_value(
                    "$count field name cannot contain '.' or start with '$'",
                ));
            }
            Ok(Stage::Count(field.clone()))
        }
        "$unwind" => parse_unwind(arg),
        "$group" => Ok(Stage::Group(group::parse_group(arg)?)),
        "$sortByCount" => Ok(Stage::SortByCount(expr::compile(arg)?)),
        "$sample" => {
            let Value::Object(options) = arg else {
                return Err(Error::bad_value("$sample requires an object with a 'size'"));
            };
            let size = options
                .get("size")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Error::bad_value("$sample requires a numeric 'size'"))?;
            if size < 0 {
                return Err(Error::bad_value(
                    "size argument to $sample must be a positive integer",
                ));
            }
            Ok(Stage::Sample { size: size as u64 })
        }
        "$bucket" => Ok(Stage::Bucket(group::parse_bucket(arg)?)),
        "$bucketAuto" => Ok(Stage::BucketAuto(group::parse_bucket_auto(arg)?)),
        "$facet" => parse_facet(arg),
        "$lookup" => Ok(Stage::Lookup(lookup::parse(arg)?)),
        "$unionWith" => {
            let (coll, pipeline) = match arg {
                Value::String(coll) => (coll.clone(), Vec::new()),
                Value::Object(options) => {
                    let coll = match options.get("coll") {
                        Some(Value::String(c)) => c.clone(),
                        _ => {
                            return Err(Error::bad_value("$unionWith requires a 'coll' string"));
                        }
                    };
                    let pipeline = match options.get("pipeline") {
                        Some(Value::Array(stages)) => parse(stages)?,
                        Some(_) => {
                            return Err(Error::bad_value("$unionWith 'pipeline' must be an array"));
                        }
                        None => Vec::new(),
                    };
                    (coll, pipeline)
                }
                _ => {
                    return Err(Error::bad_value(
                        "$unionWith requires a collection name or an options object",
                    ));
                }
            };
            Ok(Stage::UnionWith { coll, pipeline })
        }
        "$setWindowFields" => Ok(Stage::SetWindowFields(window::parse(arg)?)),
        "$merge" => Ok(Stage::Merge(merge::parse(arg)?)),
        "$out" => match arg {
            Value::String(coll) => Ok(Stage::Out(coll.clone())),
            _ => Err(Error::bad_value("$out requires a collection name string")),
        },
        other => Err(Error::bad_value(format!(
            "Unrecognized pipeline stage name: '{}'",
            other
        ))),
    }
}

fn non_negative(arg: &Value, stage: &str) -> Result<u64> {
    arg.as_i64()
        .filter(|n| *n >= 0)
        .map(|n| n as u64)
        .ok_or_else(|| Error::bad_value(format!("{} requires a non-negative integer", stage)))
}

fn parse_unwind(arg: &Value) -> Result<Stage> {
    let (raw_path, include_array_index, preserve) = match arg {
        Value::String(p) => (p.clone(), None, false),
        Value::Object(options) => {
            let raw_path = match options.get("path") {
                Some(Value::String(p)) => p.clone(),
                _ => return Err(Error::bad_value("$unwind requires a 'path' field path")),
            };
            let include = match options.get("includeArrayIndex") {
                Some(Value::String(f)) if !f.starts_with('$') => Some(f.clone()),
                Some(_) => {
                    return Err(Error::bad_value(
                        "$unwind 'includeArrayIndex' must be a plain field name",
                    ));
                }
                None => None,
            };
            let preserve = matches!(
                options.get("preserveNullAndEmptyArrays"),
                Some(Value::Bool(true))
            );
            (raw_path, include, preserve)
        }
        _ => {
            return Err(Error::bad_value(
                "$unwind requires a field path or an options object",
            ));
        }
    };
    let Some(stripped) = raw_path.strip_prefix('$') else {
        return Err(Error::bad_value(
            "$unwind field path must start with '$'",
        ));
    };
    Ok(Stage::Unwind {
        path: path::split(stripped),
        include_array_index,
        preserve_null_and_empty: preserve,
    })
}

fn parse_facet(arg: &Value) -> Result<Stage> {
    let Value::Object(specs) = arg else {
        return Err(Error::bad_value("$facet requires an object of sub-pipelines"));
    };
    if specs.is_empty() {
        return Err(Error::bad_value("$facet requires at least one sub-pipeline"));
    }
    let mut facets = Vec::with_capacity(specs.len());
    for (facet_name, stages) in specs {
        let Value::Array(stages) = stages else {
            return Err(Error::bad_value(format!(
                "$facet sub-pipeline '{}' must be an array",
                facet_name
            )));
        };
        let parsed = parse(stages)?;
        for stage in &parsed {
            if matches!(stage, Stage::Out(_) | Stage::Merge(_) | Stage::Facet(_)) {
                return Err(Error::bad_value(
                    "$facet sub-pipelines cannot include $out, $merge, or $facet",
                ));
            }
        }
        facets.push((facet_name.clone(), parsed));
    }
    Ok(Stage::Facet(facets))
}

/// Run a parsed pipeline over a buffered source.
pub fn execute(
    stages: &[Stage],
    mut docs: Vec<Document>,
    db: &mut Database,
    ctx: &EvalCtx,
) -> Result<Vec<Document>> {
    for stage in stages {
        docs = run_stage(stage, docs, db, ctx)?;
    }
    Ok(docs)
}

fn run_stage(
    stage: &Stage,
    docs: Vec<Document>,
    db: &mut Database,
    ctx: &EvalCtx,
) -> Result<Vec<Document>> {
    match stage {
        Stage::Match(pred) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                if matcher::matches(pred, &Value::Object(doc.clone()), ctx)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }

        Stage::Project(projection) => docs
            .iter()
            .map(|doc| projection::apply(projection, doc, ctx))
            .collect(),

        Stage::AddFields(add) => docs
            .iter()
            .map(|doc| projection::apply_add_fields(add, doc, ctx))
            .collect(),

        Stage::Unset(paths) => Ok(docs
            .into_iter()
            .map(|mut doc| {
                for segments in paths {
                    path::remove_path(&mut doc, segments);
                }
                doc
            })
            .collect()),

        Stage::ReplaceRoot(new_root) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                let replacement = ctx.eval_on(new_root, Value::Object(doc))?;
                match replacement {
                    Value::Object(obj) => out.push(obj),
                    other => {
                        return Err(Error::bad_value(format!(
                            "'newRoot' expression must evaluate to an object, \
                             but resulting value was of type {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(out)
        }

        Stage::Sort(sort) => {
            let mut out = docs;
            out.sort_by(|a, b| sort.compare(a, b));
            Ok(out)
        }

        Stage::Limit(n) => {
            let mut out = docs;
            out.truncate(*n as usize);
            Ok(out)
        }

        Stage::Skip(n) => Ok(docs.into_iter().skip(*n as usize).collect()),

        Stage::Count(field) => {
            let mut doc = Document::new();
            doc.insert(field.clone(), Value::from_int(docs.len() as i64));
            Ok(vec![doc])
        }

        Stage::Unwind { path: segments, include_array_index, preserve_null_and_empty } => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                let value = path::resolve(&Value::Object(doc.clone()), segments);
                match value {
                    Value::Array(items) => {
                        if items.is_empty() {
                            if *preserve_null_and_empty {
                                out.push(with_index(doc, include_array_index, Value::Null));
                            }
                            continue;
                        }
                        for (index, item) in items.into_iter().enumerate() {
                            let mut clone = doc.clone();
                            path::set_path(&mut clone, segments, item);
                            out.push(with_index(
                                clone,
                                include_array_index,
                                Value::Long(index as i64),
                            ));
                        }
                    }
                    Value::Null | Value::Missing => {
                        if *preserve_null_and_empty {
                            out.push(with_index(doc, include_array_index, Value::Null));
                        }
                    }
                    // A bare value unwinds as a single-element array.
                    _ => out.push(with_index(doc, include_array_index, Value::Null)),
                }
            }
            Ok(out)
        }

        Stage::Group(spec) => group::run_group(spec, &docs, ctx),

        Stage::SortByCount(by) => group::run_sort_by_count(by, &docs, ctx),

        Stage::Sample { size } => {
            let size = *size as usize;
            if size >= docs.len() {
                return Ok(docs);
            }
            let mut rng = rand::rng();
            let picked = rand::seq::index::sample(&mut rng, docs.len(), size);
            let mut flags = vec![false; docs.len()];
            for index in picked.into_iter() {
                flags[index] = true;
            }
            Ok(docs
                .into_iter()
                .zip(flags)
                .filter_map(|(doc, keep)| keep.then_some(doc))
                .collect())
        }

        Stage::Bucket(spec) => group::run_bucket(spec, &docs, ctx),

        Stage::BucketAuto(spec) => group::run_bucket_auto(spec, &docs, ctx),

        Stage::Facet(facets) => {
            let mut out = Document::new();
            for (facet_name, sub_stages) in facets {
                let results = execute(sub_stages, docs.clone(), db, ctx)?;
                out.insert(
                    facet_name.clone(),
                    Value::Array(results.into_iter().map(Value::Object).collect()),
                );
            }
            Ok(vec![out])
        }

        Stage::Lookup(spec) => lookup::run(spec, docs, db, ctx),

        Stage::UnionWith { coll, pipeline } => {
            let foreign = db.collection_docs(coll);
            let unioned = execute(pipeline, foreign, db, ctx)?;
            let mut out = docs;
            out.extend(unioned);
            Ok(out)
        }

        Stage::SetWindowFields(spec) => window::run(spec, docs, ctx),

        Stage::Merge(spec) => merge::run_merge(spec, docs, db, ctx),

        Stage::Out(target) => merge::run_out(target, docs, db),
    }
}

fn with_index(mut doc: Document, field: &Option<String>, index: Value) -> Document {
    if let Some(field) = field {
        path::set_path(&mut doc, &path::split(field), index);
    }
    doc
}
