//! String operators, including the regex family.

use regex::Regex;

use crate::error::{Error, Result};
use crate::value::{Document, Value};

pub fn apply(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "$concat" => concat(args),
        "$toUpper" => case(args, true),
        "$toLower" => case(args, false),
        "$strLenCP" => str_len(&args[0], "$strLenCP"),
        "$strLenBytes" => str_len(&args[0], "$strLenBytes"),
        "$split" => split(&args[0], &args[1]),
        "$substrCP" => substr_cp(&args[0], &args[1], &args[2]),
        "$indexOfCP" => index_of_cp(args),
        "$strcasecmp" => strcasecmp(&args[0], &args[1]),
        _ => Err(Error::bad_value(format!("Unrecognized expression '{}'", name))),
    }
}

fn concat(args: &[Value]) -> Result<Value> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Value::Null | Value::Missing => return Ok(Value::Null),
            Value::String(s) => out.push_str(s),
            other => {
                return Err(Error::type_mismatch(format!(
                    "$concat only supports strings, not {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(Value::String(out))
}

fn case(args: &[Value], upper: bool) -> Result<Value> {
    let op = if upper { "$toUpper" } else { "$toLower" };
    match &args[0] {
        // Null folds to the empty string here, unlike most operators.
        Value::Null | Value::Missing => Ok(Value::String(String::new())),
        Value::String(s) => Ok(Value::String(if upper {
            s.to_uppercase()
        } else {
            s.to_lowercase()
        })),
        Value::Int(n) => Ok(Value::String(n.to_string())),
        Value::Long(n) => Ok(Value::String(n.to_string())),
        Value::Double(n) => Ok(Value::String(n.to_string())),
        other => Err(Error::type_mismatch(format!(
            "{} requires a string argument, found: {}",
            op,
            other.type_name()
        ))),
    }
}

fn str_len(v: &Value, op: &str) -> Result<Value> {
    match v {
        Value::String(s) => {
            let len = if op == "$strLenCP" {
                s.chars().count()
            } else {
                s.len()
            };
            Ok(Value::from_int(len as i64))
        }
        other => Err(Error::type_mismatch(format!(
            "{} requires a string argument, found: {}",
            op,
            other.type_name()
        ))),
    }
}

fn split(input: &Value, separator: &Value) -> Result<Value> {
    if input.is_nullish() || separator.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::String(s) = input else {
        return Err(Error::type_mismatch(format!(
            "$split requires an expression that evaluates to a string as a first argument, \
             found: {}",
            input.type_name()
        )));
    };
    let Value::String(sep) = separator else {
        return Err(Error::type_mismatch(format!(
            "$split requires an expression that evaluates to a string as a second argument, \
             found: {}",
            separator.type_name()
        )));
    };
    if sep.is_empty() {
        return Err(Error::bad_value("$split requires a non-empty separator"));
    }
    Ok(Value::Array(
        s.split(sep.as_str())
            .map(|part| Value::String(part.to_string()))
            .collect(),
    ))
}

fn substr_cp(input: &Value, start: &Value, length: &Value) -> Result<Value> {
    let s = match input {
        Value::Null | Value::Missing => return Ok(Value::String(String::new())),
        Value::String(s) => s,
        other => {
            return Err(Error::type_mismatch(format!(
                "$substrCP requires a string argument, found: {}",
                other.type_name()
            )));
        }
    };
    let start = start
        .as_i64()
        .ok_or_else(|| Error::bad_value("$substrCP requires an integer starting index"))?;
    let length = length
        .as_i64()
        .ok_or_else(|| Error::bad_value("$substrCP requires an integer length"))?;
    let total = s.chars().count() as i64;
    if start < 0 || start >= total {
        return Ok(Value::String(String::new()));
    }
    let taken: String = if length < 0 {
        s.chars().skip(start as usize).collect()
    } else {
        s.chars().skip(start as usize).take(length as usize).collect()
    };
    Ok(Value::String(taken))
}

fn index_of_cp(args: &[Value]) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let Value::String(haystack) = &args[0] else {
        return Err(Error::type_mismatch(format!(
            "$indexOfCP requires a string as the first argument, found: {}",
            args[0].type_name()
        )));
    };
    let Value::String(needle) = &args[1] else {
        return Err(Error::type_mismatch(format!(
            "$indexOfCP requires a string as the second argument, found: {}",
            args[1].type_name()
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
                        "$indexOfCP requires a nonnegative integer {} index",
                        which
                    ))
                }),
        }
    };
    let start = bound(args.get(2), "starting")?.unwrap_or(0);
    let chars: Vec<char> = haystack.chars().collect();
    let end = bound(args.get(3), "ending")?.unwrap_or(chars.len()).min(chars.len());
    if start > chars.len() {
        return Ok(Value::Int(-1));
    }
    let needle_chars: Vec<char> = needle.chars().collect();
    let window = needle_chars.len();
    let mut i = start;
    while i + window <= end {
        if chars[i..i + window] == needle_chars[..] {
            return Ok(Value::from_int(i as i64));
        }
        i += 1;
    }
    Ok(Value::Int(-1))
}

fn strcasecmp(a: &Value, b: &Value) -> Result<Value> {
    let coerce = |v: &Value, position: &str| -> Result<String> {
        match v {
            Value::Null | Value::Missing => Ok(String::new()),
            Value::String(s) => Ok(s.to_lowercase()),
            Value::Int(n) => Ok(n.to_string()),
            Value::Long(n) => Ok(n.to_string()),
            Value::Double(n) => Ok(n.to_string()),
            other => Err(Error::type_mismatch(format!(
                "$strcasecmp requires a string as its {} argument, found: {}",
                position,
                other.type_name()
            ))),
        }
    };
    let left = coerce(a, "first")?;
    let right = coerce(b, "second")?;
    Ok(Value::Int(match left.cmp(&right) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

pub fn replace(all: bool, input: &Value, find: &Value, replacement: &Value) -> Result<Value> {
    let op = if all { "$replaceAll" } else { "$replaceOne" };
    if input.is_nullish() || find.is_nullish() || replacement.is_nullish() {
        return Ok(Value::Null);
    }
    let (Value::String(input), Value::String(find), Value::String(replacement)) =
        (input, find, replacement)
    else {
        return Err(Error::type_mismatch(format!(
            "{} requires that 'input', 'find' and 'replacement' be strings",
            op
        )));
    };
    Ok(Value::String(if all {
        input.replace(find.as_str(), replacement)
    } else {
        input.replacen(find.as_str(), replacement, 1)
    }))
}

pub fn trim(op: &str, input: &Value, chars: Option<&Value>) -> Result<Value> {
    if input.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::String(s) = input else {
        return Err(Error::type_mismatch(format!(
            "{} requires its input to be a string, found: {}",
            op,
            input.type_name()
        )));
    };
    let set: Option<Vec<char>> = match chars {
        None => None,
        Some(Value::Null | Value::Missing) => return Ok(Value::Null),
        Some(Value::String(cs)) => Some(cs.chars().collect()),
        Some(other) => {
            return Err(Error::type_mismatch(format!(
                "{} requires 'chars' to be a string, found: {}",
                op,
                other.type_name()
            )));
        }
    };
    let matches_set = |c: char| match &set {
        Some(cs) => cs.contains(&c),
        None => c.is_whitespace(),
    };
    let trimmed = match op {
        "$ltrim" => s.trim_start_matches(matches_set),
        "$rtrim" => s.trim_end_matches(matches_set),
        _ => s.trim_matches(matches_set),
    };
    Ok(Value::String(trimmed.to_string()))
}

/// Compile a pattern with the engine's flag set (`i`, `m`, `s`, `x`).
/// Shared with the matcher's `$regex` operator.
pub(crate) fn build_regex(pattern: &str, options: &str) -> Result<Regex> {
    let mut builder = regex::RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::bad_value(format!(
                    "invalid flag in regex options: {}",
                    other
                )));
            }
        };
    }
    builder
        .build()
        .map_err(|e| Error::bad_value(format!("Invalid regular expression: {}", e)))
}

pub fn regex_op(op: &str, input: &Value, regex: &Value, options: Option<&Value>) -> Result<Value> {
    let explicit_options = match options {
        None | Some(Value::Null | Value::Missing) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(Error::type_mismatch(format!(
                "{} requires 'options' to be a string, found: {}",
                op,
                other.type_name()
            )));
        }
    };
    let (pattern, inline_options) = match regex {
        Value::Null | Value::Missing => {
            return Ok(empty_result(op));
        }
        Value::String(p) => (p.clone(), None),
        Value::Regex { pattern, options } => (pattern.clone(), Some(options.clone())),
        other => {
            return Err(Error::type_mismatch(format!(
                "{} requires 'regex' to be a string or regular expression, found: {}",
                op,
                other.type_name()
            )));
        }
    };
    let flags = match (explicit_options, inline_options) {
        (Some(_), Some(inline)) if !inline.is_empty() => {
            return Err(Error::bad_value(format!(
                "{} found regex options specified in both 'regex' and 'options'",
                op
            )));
        }
        (Some(explicit), _) => explicit,
        (None, Some(inline)) => inline,
        (None, None) => String::new(),
    };
    let re = build_regex(&pattern, &flags)?;
    let s = match input {
        Value::Null | Value::Missing => return Ok(empty_result(op)),
        Value::String(s) => s,
        other => {
            return Err(Error::type_mismatch(format!(
                "{} needs 'input' to be of type string, found: {}",
                op,
                other.type_name()
            )));
        }
    };
    match op {
        "$regexMatch" => Ok(Value::Bool(re.is_match(s))),
        "$regexFind" => Ok(match re.captures(s) {
            Some(caps) => match_details(s, &caps),
            None => Value::Null,
        }),
        _ => {
            let mut out = Vec::new();
            for caps in re.captures_iter(s) {
                out.push(match_details(s, &caps));
            }
            Ok(Value::Array(out))
        }
    }
}

fn empty_result(op: &str) -> Value {
    match op {
        "$regexMatch" => Value::Bool(false),
        "$regexFind" => Value::Null,
        _ => Value::Array(Vec::new()),
    }
}

fn match_details(haystack: &str, caps: &regex::Captures) -> Value {
    let whole = caps.get(0).expect("group 0 always participates");
    let idx = haystack[..whole.start()].chars().count();
    let captures: Vec<Value> = (1..caps.len())
        .map(|i| match caps.get(i) {
            Some(m) => Value::String(m.as_str().to_string()),
            None => Value::Null,
        })
        .collect();
    let mut doc = Document::new();
    doc.insert("match".to_string(), Value::String(whole.as_str().to_string()));
    doc.insert("idx".to_string(), Value::from_int(idx as i64));
    doc.insert("captures".to_string(), Value::Array(captures));
    Value::Object(doc)
}
