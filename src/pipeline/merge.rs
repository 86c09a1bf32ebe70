//! `$merge` and `$out`: the two writing stages. Both build the complete
//! target contents first and swap them in at the end, so a failure at any
//! point leaves the target untouched.

use log::debug;

use crate::collection::Database;
use crate::error::{Error, Result};
use crate::eval::EvalCtx;
use crate::expr::{self, Expr};
use crate::path;
use crate::pipeline::{self, Stage};
use crate::value::{Document, Value};

#[derive(Debug, Clone)]
pub enum WhenMatched {
    Replace,
    Merge,
    KeepExisting,
    Fail,
    Pipeline(Vec<Stage>),
}

#[derive(Debug, Clone)]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub into: String,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
    pub let_vars: Vec<(String, Expr)>,
}

pub fn parse(spec: &Value) -> Result<MergeSpec> {
    let doc = match spec {
        Value::String(into) => {
            return Ok(MergeSpec {
                into: into.clone(),
                on: vec!["_id".to_string()],
                when_matched: WhenMatched::Merge,
                when_not_matched: WhenNotMatched::Insert,
                let_vars: Vec::new(),
            });
        }
        Value::Object(doc) => doc,
        _ => {
            return Err(Error::bad_value(
                "$merge requires a collection name or an options object",
            ));
        }
    };
    let into = match doc.get("into") {
        Some(Value::String(coll)) => coll.clone(),
        Some(Value::Object(target)) => match target.get("coll") {
            Some(Value::String(coll)) => coll.clone(),
            _ => return Err(Error::bad_value("$merge 'into' must name a collection")),
        },
        _ => return Err(Error::bad_value("$merge requires an 'into' collection")),
    };
    let on = match doc.get("on") {
        None => vec!["_id".to_string()],
        Some(Value::String(field)) => vec![field.clone()],
        Some(Value::Array(fields)) => {
            let mut on = Vec::with_capacity(fields.len());
            for field in fields {
                match field {
                    Value::String(s) => on.push(s.clone()),
                    _ => return Err(Error::bad_value("$merge 'on' must be strings")),
                }
            }
            if on.is_empty() {
                return Err(Error::bad_value("$merge 'on' must not be empty"));
            }
            on
        }
        Some(_) => {
            return Err(Error::bad_value(
                "$merge 'on' must be a field name or an array of field names",
            ));
        }
    };
    let when_matched = match doc.get("whenMatched") {
        None => WhenMatched::Merge,
        Some(Value::String(mode)) => match mode.as_str() {
            "replace" => WhenMatched::Replace,
            "merge" => WhenMatched::Merge,
            "keepExisting" => WhenMatched::KeepExisting,
            "fail" => WhenMatched::Fail,
            other => {
                return Err(Error::bad_value(format!(
                    "$merge found an invalid whenMatched mode: {}",
                    other
                )));
            }
        },
        Some(Value::Array(stages)) => {
            let parsed = pipeline::parse(stages)?;
            for stage in &parsed {
                match stage {
                    Stage::AddFields(_)
                    | Stage::Project(_)
                    | Stage::Unset(_)
                    | Stage::ReplaceRoot(_) => {}
                    _ => {
                        return Err(Error::bad_value(
                            "$merge whenMatched pipeline may only contain $addFields, $set, \
                             $project, $unset, $replaceRoot and $replaceWith",
                        ));
                    }
                }
            }
            WhenMatched::Pipeline(parsed)
        }
        Some(_) => {
            return Err(Error::bad_value(
                "$merge 'whenMatched' must be a mode string or a pipeline",
            ));
        }
    };
    let when_not_matched = match doc.get("whenNotMatched") {
        None => WhenNotMatched::Insert,
        Some(Value::String(mode)) => match mode.as_str() {
            "insert" => WhenNotMatched::Insert,
            "discard" => WhenNotMatched::Discard,
            "fail" => WhenNotMatched::Fail,
            other => {
                return Err(Error::bad_value(format!(
                    "$merge found an invalid whenNotMatched mode: {}",
                    other
                )));
            }
        },
        Some(_) => {
            return Err(Error::bad_value("$merge 'whenNotMatched' must be a string"));
        }
    };
    let mut let_vars = Vec::new();
    if let Some(vars) = doc.get("let") {
        let Value::Object(vars) = vars else {
            return Err(Error::bad_value("$merge 'let' must be an object"));
        };
        for (name, var_spec) in vars {
            let_vars.push((name.clone(), expr::compile(var_spec)?));
        }
    }
    Ok(MergeSpec {
        into,
        on,
        when_matched,
        when_not_matched,
        let_vars,
    })
}

fn on_key(doc: &Document, on: &[String]) -> Vec<Value> {
    on.iter()
        .map(|field| {
            match path::resolve(&Value::Object(doc.clone()), &path::split(field)) {
                Value::Missing => Value::Null,
                v => v,
            }
        })
        .collect()
}

/// Execute `$merge`. The target is rebuilt as a whole and swapped in only
/// after every source document dispatched cleanly.
pub fn run_merge(
    spec: &MergeSpec,
    docs: Vec<Document>,
    db: &mut Database,
    ctx: &EvalCtx,
) -> Result<Vec<Document>> {
    if spec.on != ["_id".to_string()] && !db.has_unique_index_on(&spec.into, &spec.on) {
        return Err(Error::bad_value(format!(
            "Cannot find index to verify that join fields will be unique for $merge on: {}",
            spec.on.join(", ")
        )));
    }
    let mut target = db.collection_docs(&spec.into);
    let mut keys: Vec<Vec<Value>> = target.iter().map(|doc| on_key(doc, &spec.on)).collect();
    for source in docs {
        let key = on_key(&source, &spec.on);
        let found = keys.iter().position(|k| *k == key);
        match found {
            Some(index) => match &spec.when_matched {
                WhenMatched::KeepExisting => {}
                WhenMatched::Replace => {
                    let mut replacement = source;
                    preserve_id(&mut replacement, &target[index]);
                    keys[index] = on_key(&replacement, &spec.on);
                    target[index] = replacement;
                }
                WhenMatched::Merge => {
                    let mut merged = target[index].clone();
                    for (k, v) in source {
                        merged.insert(k, v);
                    }
                    preserve_id(&mut merged, &target[index]);
                    keys[index] = on_key(&merged, &spec.on);
                    target[index] = merged;
                }
                WhenMatched::Fail => {
                    return Err(Error::bad_value(
                        "$merge found a matching document in the target collection, \
                         and whenMatched is set to 'fail'",
                    ));
                }
                WhenMatched::Pipeline(stages) => {
                    let mut vars = ctx.vars.clone();
                    // The source document is $$new; the existing document
                    // is the implicit CURRENT inside the pipeline.
                    vars.push(("new".to_string(), Value::Object(source.clone())));
                    for (name, var_expr) in &spec.let_vars {
                        let value = ctx.eval_on(var_expr, Value::Object(source.clone()))?;
                        vars.push((name.clone(), value));
                    }
                    let sub_ctx = EvalCtx::with_vars(ctx.now, vars);
                    let result =
                        pipeline::execute(stages, vec![target[index].clone()], db, &sub_ctx)?;
                    if let Some(mut rewritten) = result.into_iter().next() {
                        preserve_id(&mut rewritten, &target[index]);
                        keys[index] = on_key(&rewritten, &spec.on);
                        target[index] = rewritten;
                    }
                }
            },
            None => match &spec.when_not_matched {
                WhenNotMatched::Insert => {
                    let mut inserted = source;
                    if !inserted.contains_key("_id") {
                        let id = db.generate_id();
                        inserted.shift_insert(0, "_id".to_string(), id);
                    }
                    keys.push(on_key(&inserted, &spec.on));
                    target.push(inserted);
                }
                WhenNotMatched::Discard => {}
                WhenNotMatched::Fail => {
                    return Err(Error::bad_value(
                        "$merge could not find a matching document in the target \
                         collection, and whenNotMatched is set to 'fail'",
                    ));
                }
            },
        }
    }
    debug!("$merge into '{}': target now holds {} documents", spec.into, target.len());
    db.set_collection_docs(&spec.into, target)?;
    Ok(Vec::new())
}

/// Matched writes keep the existing `_id` regardless of the source's.
fn preserve_id(doc: &mut Document, existing: &Document) {
    if let Some(id) = existing.get("_id") {
        let id = id.clone();
        match doc.get_mut("_id") {
            Some(slot) => *slot = id,
            None => {
                doc.shift_insert(0, "_id".to_string(), id);
            }
        }
    }
}

/// Execute `$out`: atomically replace the whole target collection with
/// the pipeline output.
pub fn run_out(target: &str, docs: Vec<Document>, db: &mut Database) -> Result<Vec<Document>> {
    let mut replaced = Vec::with_capacity(docs.len());
    for mut doc in docs {
        if !doc.contains_key("_id") {
            let id = db.generate_id();
            doc.shift_insert(0, "_id".to_string(), id);
        }
        replaced.push(doc);
    }
    debug!("$out into '{}': {} documents", target, replaced.len());
    db.set_collection_docs(target, replaced)?;
    Ok(Vec::new())
}
