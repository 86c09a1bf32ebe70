//! Expression evaluation.
//!
//! An [`Expr`] tree evaluates against a variable [`Scope`] whose base frame
//! binds `CURRENT`, `ROOT` and `NOW`. Iteration operators (`$map`,
//! `$filter`, `$reduce`, `$let`) push child frames, so user variables
//! shadow outer bindings for the extent of their subtree.

pub(crate) mod arith;
pub(crate) mod array;
mod convert;
pub(crate) mod date;
mod object;
pub(crate) mod string;

use rand::Rng;

use crate::error::{Error, Result};
use crate::expr::{Expr, SortArrayBy};
use crate::path;
use crate::value::Value;

/// A frame stack of variable bindings. Frames link to their parent, so
/// pushing a scope for `$map`/`$let` is cheap and shadowing falls out of
/// lookup order.
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    bindings: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    /// The base frame for evaluating expressions over one document.
    /// `ROOT` aliases `CURRENT`; `NOW` is the pipeline-invocation
    /// timestamp.
    pub fn base(current: Value, now: i64) -> Scope<'static> {
        Scope {
            parent: None,
            bindings: vec![
                ("CURRENT".to_string(), current.clone()),
                ("ROOT".to_string(), current),
                ("NOW".to_string(), Value::Date(now)),
            ],
        }
    }

    /// A child frame with extra bindings shadowing the parent's.
    pub fn child(&'a self, bindings: Vec<(String, Value)>) -> Scope<'a> {
        Scope {
            parent: Some(self),
            bindings,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        for (bound, value) in self.bindings.iter().rev() {
            if bound == name {
                return Some(value);
            }
        }
        self.parent.and_then(|p| p.lookup(name))
    }

    /// The document under evaluation (`$$CURRENT`). Always bound.
    pub fn current(&self) -> &Value {
        self.lookup("CURRENT").unwrap_or(&Value::Missing)
    }
}

/// Everything an expression evaluation needs besides the document: the
/// pipeline-invocation timestamp feeding `$$NOW`, and any join variables
/// (`$lookup.let`, `$merge`'s `$$new`) visible throughout a sub-pipeline.
#[derive(Debug, Clone)]
pub struct EvalCtx {
    pub now: i64,
    pub vars: Vec<(String, Value)>,
}

impl EvalCtx {
    pub fn new(now: i64) -> EvalCtx {
        EvalCtx { now, vars: Vec::new() }
    }

    pub fn with_vars(now: i64, vars: Vec<(String, Value)>) -> EvalCtx {
        EvalCtx { now, vars }
    }

    /// Evaluate an expression with `current` as the document under
    /// evaluation.
    pub fn eval_on(&self, expr: &Expr, current: Value) -> Result<Value> {
        let base = Scope::base(current, self.now);
        if self.vars.is_empty() {
            eval(expr, &base)
        } else {
            let scoped = base.child(self.vars.clone());
            eval(expr, &scoped)
        }
    }
}

/// Evaluate an expression to a value. `Missing` flows out of bare field
/// paths; operators normalize it to Null at their boundary (`$type` being
/// the one inspector that still sees `missing`).
pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),

        Expr::FieldPath(segments) => Ok(path::resolve(scope.current(), segments)),

        Expr::Variable { name, path: var_path } => {
            let value = scope
                .lookup(name)
                .cloned()
                .ok_or_else(|| Error::bad_value(format!("Use of undefined variable: {}", name)))?;
            Ok(path::resolve(&value, var_path))
        }

        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(missing_to_null(eval(item, scope)?));
            }
            Ok(Value::Array(out))
        }

        Expr::Object(fields) => {
            let mut doc = crate::value::Document::new();
            for (name, field_expr) in fields {
                let value = eval(field_expr, scope)?;
                if !value.is_missing() {
                    doc.insert(name.clone(), value);
                }
            }
            Ok(Value::Object(doc))
        }

        Expr::Op { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                let value = eval(arg, scope)?;
                // $type is the one operator that distinguishes missing.
                if name == "$type" {
                    values.push(value);
                } else {
                    values.push(missing_to_null(value));
                }
            }
            apply_op(name, &values)
        }

        Expr::And(args) => {
            for arg in args {
                if !eval(arg, scope)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }

        Expr::Or(args) => {
            for arg in args {
                if eval(arg, scope)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }

        Expr::Cond { r#if, then, r#else } => {
            if eval(r#if, scope)?.is_truthy() {
                eval(then, scope)
            } else {
                eval(r#else, scope)
            }
        }

        Expr::IfNull(args) => {
            let mut last = Value::Null;
            for arg in args {
                last = missing_to_null(eval(arg, scope)?);
                if !last.is_null() {
                    return Ok(last);
                }
            }
            Ok(last)
        }

        Expr::Switch { branches, default } => {
            for (case, then) in branches {
                if eval(case, scope)?.is_truthy() {
                    return Ok(eval(then, scope)?);
                }
            }
            match default {
                Some(d) => eval(d, scope),
                None => Err(Error::bad_value(
                    "$switch could not find a matching branch for an input, \
                     and no default was specified.",
                )),
            }
        }

        Expr::Let { vars, body } => {
            let mut bindings = Vec::with_capacity(vars.len());
            for (name, var_expr) in vars {
                bindings.push((name.clone(), missing_to_null(eval(var_expr, scope)?)));
            }
            let inner = scope.child(bindings);
            eval(body, &inner)
        }

        Expr::Map { input, var, body } => {
            let input = missing_to_null(eval(input, scope)?);
            match input {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        let inner = scope.child(vec![(var.clone(), item)]);
                        out.push(missing_to_null(eval(body, &inner)?));
                    }
                    Ok(Value::Array(out))
                }
                other => Err(Error::type_mismatch(format!(
                    "input to $map must be an array not {}",
                    other.type_name()
                ))),
            }
        }

        Expr::Filter { input, var, cond, limit } => {
            let input = missing_to_null(eval(input, scope)?);
            match input {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => {
                    let cap = match limit {
                        Some(limit_expr) => {
                            let limit_value = missing_to_null(eval(limit_expr, scope)?);
                            if limit_value.is_null() {
                                usize::MAX
                            } else {
                                limit_value
                                    .as_i64()
                                    .filter(|n| *n >= 1)
                                    .ok_or_else(|| {
                                        Error::bad_value(
                                            "$filter 'limit' must be a positive integer",
                                        )
                                    })? as usize
                            }
                        }
                        None => usize::MAX,
                    };
                    let mut out = Vec::new();
                    for item in items {
                        if out.len() >= cap {
                            break;
                        }
                        let inner = scope.child(vec![(var.clone(), item.clone())]);
                        if eval(cond, &inner)?.is_truthy() {
                            out.push(item);
                        }
                    }
                    Ok(Value::Array(out))
                }
                other => Err(Error::type_mismatch(format!(
                    "input to $filter must be an array not {}",
                    other.type_name()
                ))),
            }
        }

        Expr::Reduce { input, initial, body } => {
            let input = missing_to_null(eval(input, scope)?);
            match input {
                Value::Null => Ok(Value::Null),
                Value::Array(items) => {
                    let mut acc = eval(initial, scope)?;
                    for item in items {
                        let inner = scope
                            .child(vec![("value".to_string(), acc), ("this".to_string(), item)]);
                        acc = eval(body, &inner)?;
                    }
                    Ok(acc)
                }
                other => Err(Error::type_mismatch(format!(
                    "input to $reduce must be an array not {}",
                    other.type_name()
                ))),
            }
        }

        Expr::Zip { inputs, use_longest_length, defaults } => {
            eval_zip(inputs, *use_longest_length, defaults.as_deref(), scope)
        }

        Expr::SortArray { input, by } => {
            let input = missing_to_null(eval(input, scope)?);
            match input {
                Value::Null => Ok(Value::Null),
                Value::Array(mut items) => {
                    sort_array(&mut items, by);
                    Ok(Value::Array(items))
                }
                other => Err(Error::type_mismatch(format!(
                    "The input argument to $sortArray must be an array, but was of type: {}",
                    other.type_name()
                ))),
            }
        }

        Expr::PickN { op, n, input } => eval_pick_n(op, n, input, scope),

        Expr::GetField { field, input } => {
            let field = eval(field, scope)?;
            let Value::String(field) = field else {
                return Err(Error::bad_value(
                    "$getField requires 'field' to evaluate to a string",
                ));
            };
            let source = match input {
                Some(input_expr) => missing_to_null(eval(input_expr, scope)?),
                None => scope.current().clone(),
            };
            match source {
                Value::Null => Ok(Value::Null),
                Value::Object(doc) => Ok(doc.get(&field).cloned().unwrap_or(Value::Missing)),
                _ => Ok(Value::Missing),
            }
        }

        Expr::SetField { field, input, value } => {
            let source = missing_to_null(eval(input, scope)?);
            match source {
                Value::Null => Ok(Value::Null),
                Value::Object(mut doc) => {
                    let new_value = eval(value, scope)?;
                    if new_value.is_missing() {
                        doc.shift_remove(field.as_str());
                    } else {
                        doc.insert(field.clone(), new_value);
                    }
                    Ok(Value::Object(doc))
                }
                other => Err(Error::type_mismatch(format!(
                    "$setField requires 'input' to evaluate to an object, found {}",
                    other.type_name()
                ))),
            }
        }

        Expr::DateFromParts { iso, parts } => {
            let mut resolved = Vec::with_capacity(parts.len());
            for (name, part_expr) in parts {
                resolved.push((name.as_str(), missing_to_null(eval(part_expr, scope)?)));
            }
            date::date_from_parts(*iso, &resolved)
        }

        Expr::DateToParts { date, iso8601 } => {
            let date = missing_to_null(eval(date, scope)?);
            date::date_to_parts(&date, *iso8601)
        }

        Expr::DateArith { subtract, start_date, unit, amount } => {
            let start = missing_to_null(eval(start_date, scope)?);
            let unit = missing_to_null(eval(unit, scope)?);
            let amount = missing_to_null(eval(amount, scope)?);
            date::date_arith(*subtract, &start, &unit, &amount)
        }

        Expr::DateDiff { start_date, end_date, unit } => {
            let start = missing_to_null(eval(start_date, scope)?);
            let end = missing_to_null(eval(end_date, scope)?);
            let unit = missing_to_null(eval(unit, scope)?);
            date::date_diff(&start, &end, &unit)
        }

        Expr::DateFromString { date_string, on_error, on_null } => {
            let input = missing_to_null(eval(date_string, scope)?);
            if input.is_null() {
                return match on_null {
                    Some(fallback) => eval(fallback, scope),
                    None => Ok(Value::Null),
                };
            }
            match date::date_from_string(&input) {
                Ok(v) => Ok(v),
                Err(err) => match on_error {
                    Some(fallback) => eval(fallback, scope),
                    None => Err(err),
                },
            }
        }

        Expr::DateToString { date, format, on_null } => {
            let date = missing_to_null(eval(date, scope)?);
            if date.is_null() {
                return match on_null {
                    // onNull's value passes through unchanged, it is not
                    // stringified.
                    Some(fallback) => eval(fallback, scope),
                    None => Ok(Value::Null),
                };
            }
            date::date_to_string(&date, format.as_deref())
        }

        Expr::Convert { input, to, on_error, on_null } => {
            let input = eval(input, scope)?;
            let to = missing_to_null(eval(to, scope)?);
            if input.is_nullish() {
                return match on_null {
                    Some(fallback) => eval(fallback, scope),
                    None => Ok(Value::Null),
                };
            }
            match convert::convert(&input, &to) {
                Ok(v) => Ok(v),
                Err(err) => match on_error {
                    Some(fallback) => eval(fallback, scope),
                    None => Err(err),
                },
            }
        }

        Expr::RegexOp { op, input, regex, options } => {
            let input = missing_to_null(eval(input, scope)?);
            let regex = missing_to_null(eval(regex, scope)?);
            let options = match options {
                Some(options_expr) => Some(missing_to_null(eval(options_expr, scope)?)),
                None => None,
            };
            string::regex_op(op, &input, &regex, options.as_ref())
        }

        Expr::Replace { all, input, find, replacement } => {
            let input = missing_to_null(eval(input, scope)?);
            let find = missing_to_null(eval(find, scope)?);
            let replacement = missing_to_null(eval(replacement, scope)?);
            string::replace(*all, &input, &find, &replacement)
        }

        Expr::Trim { op, input, chars } => {
            let input = missing_to_null(eval(input, scope)?);
            let chars = match chars {
                Some(chars_expr) => Some(missing_to_null(eval(chars_expr, scope)?)),
                None => None,
            };
            string::trim(op, &input, chars.as_ref())
        }

        // No text scoring exists in-process; the field is simply absent.
        Expr::Meta(_) => Ok(Value::Missing),

        Expr::Rand => Ok(Value::Double(rand::rng().random::<f64>())),
    }
}

pub(crate) fn missing_to_null(value: Value) -> Value {
    match value {
        Value::Missing => Value::Null,
        other => other,
    }
}

/// Dispatch a uniform positional operator over its evaluated arguments.
fn apply_op(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "$add" | "$subtract" | "$multiply" | "$divide" | "$mod" | "$abs" | "$ceil"
        | "$floor" | "$round" | "$trunc" | "$pow" | "$sqrt" | "$exp" | "$ln" | "$log"
        | "$log10" | "$sin" | "$cos" | "$tan" | "$asin" | "$acos" | "$atan" | "$atan2"
        | "$sinh" | "$cosh" | "$tanh" | "$asinh" | "$acosh" | "$atanh"
        | "$degreesToRadians" | "$radiansToDegrees" => arith::apply(name, args),

        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let ord = args[0].compare(&args[1]);
            Ok(match name {
                "$eq" => Value::Bool(args[0] == args[1]),
                "$ne" => Value::Bool(args[0] != args[1]),
                "$gt" => Value::Bool(ord.is_gt()),
                "$gte" => Value::Bool(ord.is_ge()),
                "$lt" => Value::Bool(ord.is_lt()),
                "$lte" => Value::Bool(ord.is_le()),
                _ => Value::Int(match ord {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }),
            })
        }

        "$not" => Ok(Value::Bool(!args[0].is_truthy())),

        "$concat" | "$toUpper" | "$toLower" | "$strLenCP" | "$strLenBytes" | "$split"
        | "$substrCP" | "$indexOfCP" | "$strcasecmp" => string::apply(name, args),

        "$arrayElemAt" | "$slice" | "$concatArrays" | "$size" | "$in" | "$indexOfArray"
        | "$isArray" | "$first" | "$last" | "$reverseArray" | "$range"
        | "$setUnion" | "$setIntersection" | "$setDifference" | "$setEquals"
        | "$setIsSubset" | "$allElementsTrue" | "$anyElementTrue" | "$sum" | "$avg"
        | "$min" | "$max" | "$stdDevPop" | "$stdDevSamp" => array::apply(name, args),

        "$arrayToObject" | "$objectToArray" | "$mergeObjects" => object::apply(name, args),

        "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$second"
        | "$millisecond" | "$dayOfYear" | "$dayOfWeek" | "$week" | "$isoWeek"
        | "$isoWeekYear" | "$isoDayOfWeek" => date::extract(name, &args[0]),

        "$type" | "$isNumber" | "$toInt" | "$toLong" | "$toDouble" | "$toDecimal"
        | "$toBool" | "$toString" | "$toDate" => convert::apply(name, args),

        _ => Err(Error::bad_value(format!("Unrecognized expression '{}'", name))),
    }
}

fn eval_zip(
    inputs: &Expr,
    use_longest: bool,
    defaults: Option<&Expr>,
    scope: &Scope,
) -> Result<Value> {
    let inputs = missing_to_null(eval(inputs, scope)?);
    let Value::Array(arrays) = inputs else {
        if inputs.is_null() {
            return Err(Error::bad_value("$zip 'inputs' must be an array of arrays"));
        }
        return Err(Error::type_mismatch(
            "$zip 'inputs' must be an array of arrays",
        ));
    };
    let mut resolved: Vec<Vec<Value>> = Vec::with_capacity(arrays.len());
    for array in arrays {
        match missing_to_null(array) {
            // Any null input array zips to null.
            Value::Null => return Ok(Value::Null),
            Value::Array(items) => resolved.push(items),
            other => {
                return Err(Error::type_mismatch(format!(
                    "$zip found a non-array element {} in 'inputs'",
                    other.type_name()
                )));
            }
        }
    }
    if resolved.is_empty() {
        return Err(Error::bad_value("$zip requires at least one input array"));
    }
    let defaults: Vec<Value> = match defaults {
        Some(defaults_expr) => {
            let defaults_value = missing_to_null(eval(defaults_expr, scope)?);
            match defaults_value {
                Value::Array(items) if items.len() == resolved.len() => items,
                Value::Null => vec![Value::Null; resolved.len()],
                _ => {
                    return Err(Error::bad_value(
                        "$zip 'defaults' must be an array with one element per input",
                    ));
                }
            }
        }
        None => vec![Value::Null; resolved.len()],
    };
    let len = if use_longest {
        resolved.iter().map(|a| a.len()).max().unwrap_or(0)
    } else {
        resolved.iter().map(|a| a.len()).min().unwrap_or(0)
    };
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let mut row = Vec::with_capacity(resolved.len());
        for (k, array) in resolved.iter().enumerate() {
            row.push(array.get(i).cloned().unwrap_or_else(|| defaults[k].clone()));
        }
        out.push(Value::Array(row));
    }
    Ok(Value::Array(out))
}

fn eval_pick_n(op: &str, n: &Expr, input: &Expr, scope: &Scope) -> Result<Value> {
    let n = missing_to_null(eval(n, scope)?);
    let count = n
        .as_i64()
        .filter(|v| *v >= 1)
        .ok_or_else(|| Error::bad_value(format!("{} 'n' must be a positive integer", op)))?
        as usize;
    let input = missing_to_null(eval(input, scope)?);
    match input {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let picked: Vec<Value> = match op {
                "$firstN" => items.into_iter().take(count).collect(),
                "$lastN" => {
                    let skip = items.len().saturating_sub(count);
                    items.into_iter().skip(skip).collect()
                }
                "$minN" | "$maxN" => {
                    let mut numbered: Vec<Value> =
                        items.into_iter().filter(|v| !v.is_nullish()).collect();
                    numbered.sort_by(|a, b| a.compare(b));
                    if op == "$maxN" {
                        numbered.reverse();
                    }
                    numbered.into_iter().take(count).collect()
                }
                _ => unreachable!("unknown pick-n operator"),
            };
            Ok(Value::Array(picked))
        }
        other => Err(Error::type_mismatch(format!(
            "{} requires an array input, found {}",
            op,
            other.type_name()
        ))),
    }
}

fn sort_array(items: &mut [Value], by: &SortArrayBy) {
    match by {
        SortArrayBy::Value(direction) => {
            items.sort_by(|a, b| {
                let ord = a.compare(b);
                if *direction < 0 { ord.reverse() } else { ord }
            });
        }
        SortArrayBy::Fields(keys) => {
            items.sort_by(|a, b| {
                for (segments, direction) in keys {
                    let ka = path::resolve_for_sort(a, segments);
                    let kb = path::resolve_for_sort(b, segments);
                    let ord = ka.compare(&kb);
                    if ord != std::cmp::Ordering::Equal {
                        return if *direction < 0 { ord.reverse() } else { ord };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
    }
}
