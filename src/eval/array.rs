//! Array and set operators, plus the numeric folds (`$sum`, `$avg`, ...)
//! usable as plain expressions over arrays.

use crate::error::{Error, Result};
use crate::eval::arith;
use crate::value::Value;

pub fn apply(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "$arrayElemAt" => array_elem_at(&args[0], &args[1]),
        "$slice" => slice(args),
        "$concatArrays" => concat_arrays(args),
        "$size" => size(&args[0]),
        "$in" => is_in(&args[0], &args[1]),
        "$indexOfArray" => index_of_array(args),
        "$isArray" => Ok(Value::Bool(matches!(args[0], Value::Array(_)))),
        "$first" => first_last(&args[0], "$first"),
        "$last" => first_last(&args[0], "$last"),
        "$reverseArray" => reverse_array(&args[0]),
        "$range" => range(args),
        "$setUnion" | "$setIntersection" | "$setDifference" => set_op(name, args),
        "$setEquals" => set_equals(args),
        "$setIsSubset" => set_is_subset(&args[0], &args[1]),
        "$allElementsTrue" => elements_true(&args[0], true),
        "$anyElementTrue" => elements_true(&args[0], false),
        "$sum" | "$avg" | "$min" | "$max" | "$stdDevPop" | "$stdDevSamp" => fold(name, args),
        _ => Err(Error::bad_value(format!("Unrecognized expression '{}'", name))),
    }
}

fn array_elem_at(array: &Value, index: &Value) -> Result<Value> {
    if array.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = array else {
        return Err(Error::type_mismatch(format!(
            "$arrayElemAt's first argument must be an array, but is {}",
            array.type_name()
        )));
    };
    let idx = index
        .as_i64()
        .ok_or_else(|| Error::bad_value("$arrayElemAt's second argument must be an integer"))?;
    let resolved = if idx < 0 {
        let back = idx.unsigned_abs() as usize;
        if back > items.len() {
            return Ok(Value::Missing);
        }
        items.len() - back
    } else {
        idx as usize
    };
    // Out of range yields Missing, so projected fields are omitted.
    Ok(items.get(resolved).cloned().unwrap_or(Value::Missing))
}

fn slice(args: &[Value]) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = &args[0] else {
        return Err(Error::type_mismatch(format!(
            "$slice requires an array as its first argument, found: {}",
            args[0].type_name()
        )));
    };
    let first = args[1]
        .as_i64()
        .ok_or_else(|| Error::bad_value("$slice requires integer arguments"))?;
    let taken: Vec<Value> = if args.len() == 2 {
        if first < 0 {
            let back = first.unsigned_abs() as usize;
            let skip = items.len().saturating_sub(back);
            items[skip..].to_vec()
        } else {
            items.iter().take(first as usize).cloned().collect()
        }
    } else {
        let count = args[2]
            .as_i64()
            .ok_or_else(|| Error::bad_value("$slice requires integer arguments"))?;
        if count <= 0 {
            return Err(Error::bad_value(
                "$slice requires a positive count when a skip is supplied",
            ));
        }
        let skip = if first < 0 {
            items.len().saturating_sub(first.unsigned_abs() as usize)
        } else {
            (first as usize).min(items.len())
        };
        items.iter().skip(skip).take(count as usize).cloned().collect()
    };
    Ok(Value::Array(taken))
}

fn concat_arrays(args: &[Value]) -> Result<Value> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Null | Value::Missing => return Ok(Value::Null),
            Value::Array(items) => out.extend(items.iter().cloned()),
            other => {
                return Err(Error::type_mismatch(format!(
                    "$concatArrays only supports arrays, not {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(Value::Array(out))
}

fn size(v: &Value) -> Result<Value> {
    match v {
        Value::Array(items) => Ok(Value::from_int(items.len() as i64)),
        other => Err(Error::type_mismatch(format!(
            "The argument to $size must be an array, found: {}",
            other.type_name()
        ))),
    }
}

fn is_in(needle: &Value, haystack: &Value) -> Result<Value> {
    let Value::Array(items) = haystack else {
        return Err(Error::type_mismatch(format!(
            "$in requires an array as a second argument, found: {}",
            haystack.type_name()
        )));
    };
    Ok(Value::Bool(items.iter().any(|item| item == needle)))
}

fn index_of_array(args: &[Value]) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = &args[0] else {
        return Err(Error::type_mismatch(format!(
            "$indexOfArray requires an array as a first argument, found: {}",
            args[0].type_name()
        )));
    };
    let bound = |v: Option<&Value>, which: &str| -> Result<Option<usize>> {
        match v {
            None => Ok(None),
            Some(bound_value) => bound_value
                .as_i64()
                .filter(|n| *n >= 0)
                .map(|n| Some(n as usize))
                .ok_or_else(|| {
                    Error::bad_value(format!(
                        "$indexOfArray requires a nonnegative integer {} index",
                        which
                    ))
                }),
        }
    };
    let start = bound(args.get(2), "starting")?.unwrap_or(0);
    let end = bound(args.get(3), "ending")?.unwrap_or(items.len()).min(items.len());
    for i in start..end {
        if items[i] == args[1] {
            return Ok(Value::from_int(i as i64));
        }
    }
    Ok(Value::Int(-1))
}

fn first_last(v: &Value, op: &str) -> Result<Value> {
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = v else {
        return Err(Error::type_mismatch(format!(
            "{}'s argument must be an array, but is {}",
            op,
            v.type_name()
        )));
    };
    let picked = if op == "$first" { items.first() } else { items.last() };
    Ok(picked.cloned().unwrap_or(Value::Missing))
}

fn reverse_array(v: &Value) -> Result<Value> {
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = v else {
        return Err(Error::type_mismatch(format!(
            "The argument to $reverseArray must be an array, found: {}",
            v.type_name()
        )));
    };
    let mut out = items.clone();
    out.reverse();
    Ok(Value::Array(out))
}

fn range(args: &[Value]) -> Result<Value> {
    let int32 = |v: &Value, which: &str| -> Result<i64> {
        v.as_i64()
            .filter(|n| i32::try_from(*n).is_ok())
            .ok_or_else(|| {
                Error::bad_value(format!(
                    "$range requires a numeric value representable as a 32-bit integer for '{}'",
                    which
                ))
            })
    };
    let start = int32(&args[0], "start")?;
    let end = int32(&args[1], "end")?;
    let step = match args.get(2) {
        Some(v) => int32(v, "step")?,
        None => 1,
    };
    if step == 0 {
        return Err(Error::bad_value("$range requires a non-zero step value"));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < end) || (step < 0 && current > end) {
        out.push(Value::from_int(current));
        current += step;
    }
    Ok(Value::Array(out))
}

// ========================================
// Set operators
// ========================================

fn dedup(items: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn set_op(name: &str, args: &[Value]) -> Result<Value> {
    let mut sets: Vec<Vec<Value>> = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Null | Value::Missing => return Ok(Value::Null),
            Value::Array(items) => sets.push(items.clone()),
            other => {
                return Err(Error::type_mismatch(format!(
                    "All operands of {} must be arrays. One argument is of type: {}",
                    name,
                    other.type_name()
                )));
            }
        }
    }
    match name {
        "$setUnion" => {
            let mut out: Vec<Value> = Vec::new();
            for set in &sets {
                for item in set {
                    if !out.contains(item) {
                        out.push(item.clone());
                    }
                }
            }
            Ok(Value::Array(out))
        }
        "$setIntersection" => {
            let Some((head, rest)) = sets.split_first() else {
                return Ok(Value::Array(Vec::new()));
            };
            let out: Vec<Value> = dedup(head)
                .into_iter()
                .filter(|item| rest.iter().all(|set| set.contains(item)))
                .collect();
            Ok(Value::Array(out))
        }
        _ => {
            let out: Vec<Value> = dedup(&sets[0])
                .into_iter()
                .filter(|item| !sets[1].contains(item))
                .collect();
            Ok(Value::Array(out))
        }
    }
}

fn set_equals(args: &[Value]) -> Result<Value> {
    let mut sets: Vec<Vec<Value>> = Vec::with_capacity(args.len());
    for arg in args {
        // Null operands are an error here, unlike the other set operators.
        let Value::Array(items) = arg else {
            return Err(Error::type_mismatch(format!(
                "All operands of $setEquals must be arrays. One argument is of type: {}",
                arg.type_name()
            )));
        };
        sets.push(dedup(items));
    }
    let (head, rest) = sets.split_first().expect("arity checked at compile");
    for set in rest {
        if set.len() != head.len() || !head.iter().all(|item| set.contains(item)) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn set_is_subset(a: &Value, b: &Value) -> Result<Value> {
    let (Value::Array(a), Value::Array(b)) = (a, b) else {
        let offender = if matches!(a, Value::Array(_)) { b } else { a };
        return Err(Error::type_mismatch(format!(
            "All operands of $setIsSubset must be arrays. One argument is of type: {}",
            offender.type_name()
        )));
    };
    Ok(Value::Bool(a.iter().all(|item| b.contains(item))))
}

fn elements_true(v: &Value, all: bool) -> Result<Value> {
    let op = if all { "$allElementsTrue" } else { "$anyElementTrue" };
    let Value::Array(items) = v else {
        return Err(Error::type_mismatch(format!(
            "{}'s argument must be an array, but is {}",
            op,
            v.type_name()
        )));
    };
    Ok(Value::Bool(if all {
        items.iter().all(|item| item.is_truthy())
    } else {
        items.iter().any(|item| item.is_truthy())
    }))
}

// ========================================
// Numeric folds
// ========================================

/// The values a fold ranges over: a single array argument folds its
/// elements, anything else folds the argument list itself.
fn fold_items(args: &[Value]) -> Vec<Value> {
    match args {
        [Value::Array(items)] => items.clone(),
        _ => args.to_vec(),
    }
}

fn fold(name: &str, args: &[Value]) -> Result<Value> {
    let items = fold_items(args);
    match name {
        "$sum" => Ok(numeric_sum(&items)),
        "$avg" => Ok(numeric_avg(&items)),
        "$min" => Ok(items
            .iter()
            .filter(|v| !v.is_nullish())
            .min_by(|a, b| a.compare(b))
            .cloned()
            .unwrap_or(Value::Null)),
        "$max" => Ok(items
            .iter()
            .filter(|v| !v.is_nullish())
            .max_by(|a, b| a.compare(b))
            .cloned()
            .unwrap_or(Value::Null)),
        "$stdDevPop" => Ok(std_dev(&items, false)),
        _ => Ok(std_dev(&items, true)),
    }
}

/// Sum of the numeric members; non-numeric values are ignored. The empty
/// sum is Int(0).
pub(crate) fn numeric_sum(items: &[Value]) -> Value {
    let mut acc = Value::Int(0);
    for item in items {
        if item.is_number() {
            acc = arith::add_pair(&acc, item);
        }
    }
    acc
}

/// Average of the numeric members; Null when none were seen.
pub(crate) fn numeric_avg(items: &[Value]) -> Value {
    let mut sum = 0.0;
    let mut count = 0usize;
    for item in items {
        if let Some(n) = item.as_f64() {
            sum += n;
            count += 1;
        }
    }
    if count == 0 {
        Value::Null
    } else {
        Value::Double(sum / count as f64)
    }
}

/// Population or sample standard deviation over the numeric members.
/// Returns Null when the input cannot support the statistic (no numbers,
/// or a single number for the sample form).
pub(crate) fn std_dev(items: &[Value], sample: bool) -> Value {
    let numbers: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
    let n = numbers.len();
    if n == 0 || (sample && n < 2) {
        return Value::Null;
    }
    let mean = numbers.iter().sum::<f64>() / n as f64;
    let divisor = if sample { n - 1 } else { n } as f64;
    let variance = numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / divisor;
    Value::Double(variance.sqrt())
}
