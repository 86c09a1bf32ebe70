//! Update documents for `updateOne`/`updateMany`: the `$set`-family
//! operator grammar, plus full-document replacement.

use crate::error::{Error, Result};
use crate::eval::arith;
use crate::matcher;
use crate::path;
use crate::value::{Document, Value};

/// Apply an update document to one matched document. A spec whose keys
/// all start with `$` is an operator update; anything else replaces the
/// document wholesale (keeping `_id`).
pub fn apply(doc: &Document, update: &Value) -> Result<Document> {
    let Value::Object(spec) = update else {
        return Err(Error::failed_to_parse("update document must be an object"));
    };
    let has_operators = spec.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        return Ok(replacement(doc, spec)?);
    }
    let mut out = doc.clone();
    for (op, arg) in spec {
        let Value::Object(fields) = arg else {
            return Err(Error::failed_to_parse(format!(
                "the argument to {} must be an object",
                op
            )));
        };
        for (field, value) in fields {
            if field == "_id" {
                let unchanged = op == "$set" && doc.get("_id") == Some(value);
                if !unchanged {
                    return Err(Error::bad_value(
                        "Performing an update on the path '_id' would modify the \
                         immutable field '_id'",
                    ));
                }
                continue;
            }
            apply_field(&mut out, op, field, value)?;
        }
    }
    Ok(out)
}

/// Replace everything but `_id`. A replacement carrying a different `_id`
/// is an error.
pub fn replacement(doc: &Document, spec: &Document) -> Result<Document> {
    if let (Some(old), Some(new)) = (doc.get("_id"), spec.get("_id")) {
        if old != new {
            return Err(Error::bad_value(
                "the _id field cannot be changed from the existing value by a replacement",
            ));
        }
    }
    let mut out = Document::new();
    if let Some(id) = doc.get("_id") {
        out.insert("_id".to_string(), id.clone());
    }
    for (k, v) in spec {
        if k != "_id" {
            out.insert(k.clone(), v.clone());
        }
    }
    Ok(out)
}

fn current_value(doc: &Document, segments: &[String]) -> Value {
    path::resolve(&Value::Object(doc.clone()), segments)
}

fn apply_field(doc: &mut Document, op: &str, field: &str, value: &Value) -> Result<()> {
    let segments = path::split(field);
    match op {
        "$set" => path::set_path(doc, &segments, value.clone()),
        "$unset" => path::remove_path(doc, &segments),
        "$inc" | "$mul" => {
            if !value.is_number() {
                return Err(Error::type_mismatch(format!(
                    "Cannot {} with non-numeric argument: {{{}: {}}}",
                    if op == "$inc" { "increment" } else { "multiply" },
                    field,
                    value.type_name()
                )));
            }
            let existing = current_value(doc, &segments);
            let updated = match existing {
                Value::Missing => {
                    if op == "$inc" {
                        value.clone()
                    } else {
                        // $mul on a missing field seeds a zero of the
                        // multiplier's type.
                        arith::apply("$multiply", &[Value::Int(0), value.clone()])?
                    }
                }
                existing if existing.is_number() => {
                    if op == "$inc" {
                        arith::add_pair(&existing, value)
                    } else {
                        arith::apply("$multiply", &[existing.clone(), value.clone()])?
                    }
                }
                other => {
                    return Err(Error::type_mismatch(format!(
                        "Cannot apply {} to a value of non-numeric type ({})",
                        op,
                        other.type_name()
                    )));
                }
            };
            path::set_path(doc, &segments, updated);
        }
        "$min" | "$max" => {
            let existing = current_value(doc, &segments);
            let replace = match &existing {
                Value::Missing => true,
                current => {
                    let ord = value.compare(current);
                    if op == "$min" { ord.is_lt() } else { ord.is_gt() }
                }
            };
            if replace {
                path::set_path(doc, &segments, value.clone());
            }
        }
        "$rename" => {
            let Value::String(new_name) = value else {
                return Err(Error::bad_value(
                    "The 'to' field for $rename must be a string",
                ));
            };
            let existing = current_value(doc, &segments);
            if !existing.is_missing() {
                path::remove_path(doc, &segments);
                path::set_path(doc, &path::split(new_name), existing);
            }
        }
        "$push" => {
            let mut items = match current_value(doc, &segments) {
                Value::Missing => Vec::new(),
                Value::Array(items) => items,
                other => {
                    return Err(Error::bad_value(format!(
                        "The field '{}' must be an array but is of type {}",
                        field,
                        other.type_name()
                    )));
                }
            };
            items.extend(each_values(value));
            path::set_path(doc, &segments, Value::Array(items));
        }
        "$addToSet" => {
            let mut items = match current_value(doc, &segments) {
                Value::Missing => Vec::new(),
                Value::Array(items) => items,
                other => {
                    return Err(Error::bad_value(format!(
                        "Cannot apply $addToSet to non-array field '{}' of type {}",
                        field,
                        other.type_name()
                    )));
                }
            };
            for item in each_values(value) {
                if !items.contains(&item) {
                    items.push(item);
                }
            }
            path::set_path(doc, &segments, Value::Array(items));
        }
        "$pop" => {
            let direction = value
                .as_i64()
                .filter(|n| *n == 1 || *n == -1)
                .ok_or_else(|| Error::failed_to_parse("$pop expects 1 or -1"))?;
            if let Value::Array(mut items) = current_value(doc, &segments) {
                if !items.is_empty() {
                    if direction == 1 {
                        items.pop();
                    } else {
                        items.remove(0);
                    }
                }
                path::set_path(doc, &segments, Value::Array(items));
            }
        }
        "$pull" => {
            if let Value::Array(items) = current_value(doc, &segments) {
                let kept = pull_filter(items, value)?;
                path::set_path(doc, &segments, Value::Array(kept));
            }
        }
        other => {
            return Err(Error::failed_to_parse(format!(
                "Unknown modifier: {}",
                other
            )));
        }
    }
    Ok(())
}

/// `$push`/`$addToSet` accept a bare value or `{$each: [...]}`.
fn each_values(value: &Value) -> Vec<Value> {
    if let Value::Object(doc) = value {
        if doc.len() == 1 {
            if let Some(Value::Array(items)) = doc.get("$each") {
                return items.clone();
            }
        }
    }
    vec![value.clone()]
}

/// `$pull` removes elements equal to the value, or — for an operator
/// document — elements matching the condition.
fn pull_filter(items: Vec<Value>, condition: &Value) -> Result<Vec<Value>> {
    let is_condition = matches!(
        condition,
        Value::Object(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
    );
    if is_condition {
        let mut filter = Document::new();
        filter.insert("v".to_string(), condition.clone());
        let pred = matcher::compile(&Value::Object(filter))?;
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let mut probe = Document::new();
            probe.insert("v".to_string(), item.clone());
            if !matcher::matches(&pred, &Value::Object(probe), &crate::eval::EvalCtx::new(0))? {
                kept.push(item);
            }
        }
        Ok(kept)
    } else {
        Ok(items.into_iter().filter(|item| item != condition).collect())
    }
}

/// Seed an upsert document: the filter's equality conditions become
/// fields, then the update applies on top.
pub fn upsert_seed(filter: &Value, update: &Value) -> Result<Document> {
    let mut seed = Document::new();
    if let Value::Object(conditions) = filter {
        for (field, spec) in conditions {
            if field.starts_with('$') {
                continue;
            }
            let equality = match spec {
                Value::Object(inner) if inner.keys().any(|k| k.starts_with('$')) => {
                    inner.get("$eq").cloned()
                }
                other => Some(other.clone()),
            };
            if let Some(value) = equality {
                path::set_path(&mut seed, &path::split(field), value);
            }
        }
    }
    apply(&seed, update)
}
