//! Object operators.

use crate::error::{Error, Result};
use crate::value::{Document, Value};

pub fn apply(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "$mergeObjects" => merge_objects(args),
        "$objectToArray" => object_to_array(&args[0]),
        "$arrayToObject" => array_to_object(&args[0]),
        _ => Err(Error::bad_value(format!("Unrecognized expression '{}'", name))),
    }
}

/// Merge documents left to right; later fields override earlier ones.
/// Null arguments are skipped. A single array argument merges its
/// elements.
pub(crate) fn merge_objects(args: &[Value]) -> Result<Value> {
    let items: Vec<&Value> = match args {
        [Value::Array(items)] => items.iter().collect(),
        _ => args.iter().collect(),
    };
    let mut out = Document::new();
    for item in items {
        match item {
            Value::Null | Value::Missing => continue,
            Value::Object(doc) => {
                for (k, v) in doc {
                    out.insert(k.clone(), v.clone());
                }
            }
            other => {
                return Err(Error::type_mismatch(format!(
                    "$mergeObjects requires object inputs, but input is of type {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(Value::Object(out))
}

fn object_to_array(v: &Value) -> Result<Value> {
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Object(doc) = v else {
        return Err(Error::type_mismatch(format!(
            "$objectToArray requires a document input, found: {}",
            v.type_name()
        )));
    };
    let out: Vec<Value> = doc
        .iter()
        .map(|(k, value)| {
            let mut pair = Document::new();
            pair.insert("k".to_string(), Value::String(k.clone()));
            pair.insert("v".to_string(), value.clone());
            Value::Object(pair)
        })
        .collect();
    Ok(Value::Array(out))
}

fn array_to_object(v: &Value) -> Result<Value> {
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = v else {
        return Err(Error::type_mismatch(format!(
            "$arrayToObject requires an array input, found: {}",
            v.type_name()
        )));
    };
    let mut out = Document::new();
    for item in items {
        match item {
            // {k: ..., v: ...} form
            Value::Object(pair) if pair.len() == 2 => {
                let (Some(Value::String(k)), Some(value)) = (pair.get("k"), pair.get("v")) else {
                    return Err(Error::bad_value(
                        "$arrayToObject requires object elements with 'k' and 'v' fields",
                    ));
                };
                out.insert(k.clone(), value.clone());
            }
            // [key, value] form
            Value::Array(pair) if pair.len() == 2 => {
                let Value::String(k) = &pair[0] else {
                    return Err(Error::bad_value(
                        "$arrayToObject requires array elements whose first entry is a string",
                    ));
                };
                out.insert(k.clone(), pair[1].clone());
            }
            _ => {
                return Err(Error::bad_value(
                    "$arrayToObject requires an array of key-value pairs",
                ));
            }
        }
    }
    Ok(Value::Object(out))
}
