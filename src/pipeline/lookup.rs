//! `$lookup`: the equi-join form and the correlated `pipeline`/`let`
//! form. Each input document joins independently against the foreign
//! collection.

use crate::collection::Database;
use crate::error::{Error, Result};
use crate::eval::EvalCtx;
use crate::expr::{self, Expr};
use crate::path;
use crate::pipeline::{self, Stage};
use crate::value::{Document, Value};

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: Option<Vec<String>>,
    pub foreign_field: Option<Vec<String>>,
    pub let_vars: Vec<(String, Expr)>,
    pub pipeline: Option<Vec<Stage>>,
    pub as_field: Vec<String>,
}

pub fn parse(spec: &Value) -> Result<LookupSpec> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$lookup specification must be an object"));
    };
    let string_field = |name: &str| -> Result<Option<String>> {
        match doc.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Error::bad_value(format!(
                "$lookup '{}' must be a string",
                name
            ))),
        }
    };
    let from = string_field("from")?
        .ok_or_else(|| Error::bad_value("$lookup requires a 'from' collection name"))?;
    let as_field = string_field("as")?
        .ok_or_else(|| Error::bad_value("$lookup requires an 'as' output field"))?;
    let local_field = string_field("localField")?.map(|f| path::split(&f));
    let foreign_field = string_field("foreignField")?.map(|f| path::split(&f));
    if local_field.is_some() != foreign_field.is_some() {
        return Err(Error::bad_value(
            "$lookup requires 'localField' and 'foreignField' to be specified together",
        ));
    }
    let mut let_vars = Vec::new();
    if let Some(vars) = doc.get("let") {
        let Value::Object(vars) = vars else {
            return Err(Error::bad_value("$lookup 'let' must be an object"));
        };
        for (name, var_spec) in vars {
            let_vars.push((name.clone(), expr::compile(var_spec)?));
        }
    }
    let sub_pipeline = match doc.get("pipeline") {
        None => None,
        Some(Value::Array(stages)) => Some(pipeline::parse(stages)?),
        Some(_) => return Err(Error::bad_value("$lookup 'pipeline' must be an array")),
    };
    if sub_pipeline.is_none() && local_field.is_none() {
        return Err(Error::bad_value(
            "$lookup requires either 'pipeline' or both 'localField' and 'foreignField'",
        ));
    }
    if !let_vars.is_empty() && sub_pipeline.is_none() {
        return Err(Error::bad_value("$lookup 'let' requires a 'pipeline'"));
    }
    Ok(LookupSpec {
        from,
        local_field,
        foreign_field,
        let_vars,
        pipeline: sub_pipeline,
        as_field: path::split(&as_field),
    })
}

pub fn run(
    spec: &LookupSpec,
    docs: Vec<Document>,
    db: &mut Database,
    ctx: &EvalCtx,
) -> Result<Vec<Document>> {
    let foreign = db.collection_docs(&spec.from);
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let current = Value::Object(doc.clone());

        // Equality prefilter (the simple form, or the concise correlated
        // combination with a pipeline).
        let mut matched: Vec<Document> = match (&spec.local_field, &spec.foreign_field) {
            (Some(local), Some(foreign_path)) => {
                let local_value = path::resolve(&current, local);
                foreign
                    .iter()
                    .filter(|fdoc| {
                        let foreign_value =
                            path::resolve(&Value::Object((*fdoc).clone()), foreign_path);
                        join_matches(&local_value, &foreign_value)
                    })
                    .cloned()
                    .collect()
            }
            _ => foreign.clone(),
        };

        if let Some(sub_stages) = &spec.pipeline {
            let mut vars = ctx.vars.clone();
            for (name, var_expr) in &spec.let_vars {
                let value = match ctx.eval_on(var_expr, current.clone())? {
                    Value::Missing => Value::Null,
                    v => v,
                };
                vars.push((name.clone(), value));
            }
            let sub_ctx = EvalCtx::with_vars(ctx.now, vars);
            matched = pipeline::execute(sub_stages, matched, db, &sub_ctx)?;
        }

        path::set_path(
            &mut doc,
            &spec.as_field,
            Value::Array(matched.into_iter().map(Value::Object).collect()),
        );
        out.push(doc);
    }
    Ok(out)
}

/// Equality for the equi-join: array-aware on both sides, with missing
/// folding to null.
fn join_matches(local: &Value, foreign: &Value) -> bool {
    let norm = |v: &Value| if v.is_missing() { Value::Null } else { v.clone() };
    let local = norm(local);
    let foreign = norm(foreign);
    if local == foreign {
        return true;
    }
    if let Value::Array(items) = &local {
        if items.iter().any(|item| *item == foreign) {
            return true;
        }
    }
    if let Value::Array(items) = &foreign {
        if items.iter().any(|item| *item == local) {
            return true;
        }
    }
    false
}
