use crate::error::{Error, Result};
use crate::path;
use crate::value::Value;

/// A compiled aggregation expression.
///
/// Expression specs arrive as [`Value`] trees (field paths are strings
/// starting with `$`, variables with `$$`, operators are single-key
/// objects) and compile once into this tree; evaluation never re-parses.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant, including anything wrapped in `$literal`
    Literal(Value),

    /// `"$a.b.c"` — resolved against `$$CURRENT`
    FieldPath(Vec<String>),

    /// `"$$name.a.b"` — variable reference with optional trailing path
    Variable { name: String, path: Vec<String> },

    /// Array literal; elements evaluate independently
    Array(Vec<Expr>),

    /// Object literal; fields evaluating to Missing are omitted
    Object(Vec<(String, Expr)>),

    /// A positional operator call (`{$abs: [...]}` and friends)
    Op { name: String, args: Vec<Expr> },

    /// `$and` — short-circuits left to right, empty is true
    And(Vec<Expr>),

    /// `$or` — short-circuits left to right, empty is false
    Or(Vec<Expr>),

    Cond {
        r#if: Box<Expr>,
        then: Box<Expr>,
        r#else: Box<Expr>,
    },

    IfNull(Vec<Expr>),

    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },

    Let {
        vars: Vec<(String, Expr)>,
        body: Box<Expr>,
    },

    Map {
        input: Box<Expr>,
        var: String,
        body: Box<Expr>,
    },

    Filter {
        input: Box<Expr>,
        var: String,
        cond: Box<Expr>,
        limit: Option<Box<Expr>>,
    },

    Reduce {
        input: Box<Expr>,
        initial: Box<Expr>,
        body: Box<Expr>,
    },

    Zip {
        inputs: Box<Expr>,
        use_longest_length: bool,
        defaults: Option<Box<Expr>>,
    },

    SortArray {
        input: Box<Expr>,
        by: SortArrayBy,
    },

    /// `$firstN` / `$lastN` / `$minN` / `$maxN`
    PickN {
        op: String,
        n: Box<Expr>,
        input: Box<Expr>,
    },

    GetField {
        field: Box<Expr>,
        input: Option<Box<Expr>>,
    },

    SetField {
        field: String,
        input: Box<Expr>,
        value: Box<Expr>,
    },

    DateFromParts {
        iso: bool,
        parts: Vec<(String, Expr)>,
    },

    DateToParts {
        date: Box<Expr>,
        iso8601: bool,
    },

    /// `$dateAdd` / `$dateSubtract`
    DateArith {
        subtract: bool,
        start_date: Box<Expr>,
        unit: Box<Expr>,
        amount: Box<Expr>,
    },

    DateDiff {
        start_date: Box<Expr>,
        end_date: Box<Expr>,
        unit: Box<Expr>,
    },

    DateFromString {
        date_string: Box<Expr>,
        on_error: Option<Box<Expr>>,
        on_null: Option<Box<Expr>>,
    },

    DateToString {
        date: Box<Expr>,
        format: Option<String>,
        on_null: Option<Box<Expr>>,
    },

    Convert {
        input: Box<Expr>,
        to: Box<Expr>,
        on_error: Option<Box<Expr>>,
        on_null: Option<Box<Expr>>,
    },

    /// `$regexMatch` / `$regexFind` / `$regexFindAll`
    RegexOp {
        op: String,
        input: Box<Expr>,
        regex: Box<Expr>,
        options: Option<Box<Expr>>,
    },

    /// `$replaceOne` / `$replaceAll`
    Replace {
        all: bool,
        input: Box<Expr>,
        find: Box<Expr>,
        replacement: Box<Expr>,
    },

    /// `$trim` / `$ltrim` / `$rtrim`
    Trim {
        op: String,
        input: Box<Expr>,
        chars: Option<Box<Expr>>,
    },

    Meta(String),

    Rand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortArrayBy {
    /// Whole-value sort, ascending (1) or descending (-1)
    Value(i8),
    /// Field-wise compound sort over object elements
    Fields(Vec<(Vec<String>, i8)>),
}

/// Compile an expression spec into an [`Expr`] tree.
///
/// Structural problems (unknown operators, arity violations, malformed
/// named arguments) are reported here, before any document is touched.
pub fn compile(spec: &Value) -> Result<Expr> {
    match spec {
        Value::String(s) if s.starts_with("$$") => {
            let body = &s[2..];
            if body.is_empty() {
                return Err(Error::bad_value("empty variable reference '$$'"));
            }
            let mut segments = path::split(body);
            let name = segments.remove(0);
            Ok(Expr::Variable { name, path: segments })
        }
        Value::String(s) if s.starts_with('$') => {
            let body = &s[1..];
            if body.is_empty() {
                return Err(Error::bad_value("empty field path '$'"));
            }
            Ok(Expr::FieldPath(path::split(body)))
        }
        Value::Array(items) => {
            let compiled: Result<Vec<Expr>> = items.iter().map(compile).collect();
            Ok(Expr::Array(compiled?))
        }
        Value::Object(doc) => {
            let operator_keys: Vec<&String> =
                doc.keys().filter(|k| k.starts_with('$')).collect();
            if operator_keys.is_empty() {
                let mut fields = Vec::with_capacity(doc.len());
                for (k, v) in doc {
                    fields.push((k.clone(), compile(v)?));
                }
                return Ok(Expr::Object(fields));
            }
            if doc.len() != 1 {
                return Err(Error::bad_value(format!(
                    "an expression specification must contain exactly one field, found {}",
                    doc.len()
                )));
            }
            let (name, arg) = doc.iter().next().unwrap();
            compile_operator(name, arg)
        }
        other => Ok(Expr::Literal(other.clone())),
    }
}

/// Wrap a spec into its argument list: arrays are the list, anything else
/// is a single argument.
fn args_list(arg: &Value) -> Vec<&Value> {
    match arg {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn named(doc: &Value, op: &str) -> Result<crate::value::Document> {
    match doc {
        Value::Object(map) => Ok(map.clone()),
        other => Err(Error::bad_value(format!(
            "{} expects an object argument, found {}",
            op,
            other.type_name()
        ))),
    }
}

fn named_field(map: &crate::value::Document, op: &str, field: &str) -> Result<Expr> {
    match map.get(field) {
        Some(v) => compile(v),
        None => Err(Error::bad_value(format!("{} requires '{}'", op, field))),
    }
}

fn optional_field(map: &crate::value::Document, field: &str) -> Result<Option<Box<Expr>>> {
    match map.get(field) {
        Some(v) => Ok(Some(Box::new(compile(v)?))),
        None => Ok(None),
    }
}

fn reject_unknown(map: &crate::value::Document, op: &str, allowed: &[&str]) -> Result<()> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(Error::bad_value(format!(
                "Unrecognized argument to {}: {}",
                op, key
            )));
        }
    }
    Ok(())
}

fn compile_operator(name: &str, arg: &Value) -> Result<Expr> {
    match name {
        "$literal" => Ok(Expr::Literal(arg.clone())),

        "$and" | "$or" => {
            let args: Result<Vec<Expr>> = args_list(arg).into_iter().map(compile).collect();
            let args = args?;
            Ok(if name == "$and" { Expr::And(args) } else { Expr::Or(args) })
        }

        "$cond" => match arg {
            Value::Array(items) => {
                if items.len() != 3 {
                    return Err(arity_error(name, 3, items.len()));
                }
                Ok(Expr::Cond {
                    r#if: Box::new(compile(&items[0])?),
                    then: Box::new(compile(&items[1])?),
                    r#else: Box::new(compile(&items[2])?),
                })
            }
            Value::Object(map) => {
                reject_unknown(map, name, &["if", "then", "else"])?;
                Ok(Expr::Cond {
                    r#if: Box::new(named_field(map, name, "if")?),
                    then: Box::new(named_field(map, name, "then")?),
                    r#else: Box::new(named_field(map, name, "else")?),
                })
            }
            _ => Err(Error::bad_value("$cond requires an array or an object")),
        },

        "$ifNull" => {
            let args: Result<Vec<Expr>> = args_list(arg).into_iter().map(compile).collect();
            let args = args?;
            if args.len() < 2 {
                return Err(Error::bad_value(
                    "$ifNull needs at least two arguments",
                ));
            }
            Ok(Expr::IfNull(args))
        }

        "$switch" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["branches", "default"])?;
            let branch_specs = map
                .get("branches")
                .and_then(|b| b.as_array())
                .ok_or_else(|| Error::bad_value("$switch requires a 'branches' array"))?;
            let mut branches = Vec::with_capacity(branch_specs.len());
            for branch in branch_specs {
                let bmap = named(branch, "$switch branch")?;
                reject_unknown(&bmap, "$switch branch", &["case", "then"])?;
                branches.push((
                    named_field(&bmap, "$switch branch", "case")?,
                    named_field(&bmap, "$switch branch", "then")?,
                ));
            }
            Ok(Expr::Switch {
                branches,
                default: optional_field(&map, "default")?,
            })
        }

        "$let" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["vars", "in"])?;
            let var_specs = map
                .get("vars")
                .and_then(|v| v.as_object())
                .ok_or_else(|| Error::bad_value("$let requires a 'vars' object"))?;
            let mut vars = Vec::with_capacity(var_specs.len());
            for (vname, vspec) in var_specs {
                vars.push((vname.clone(), compile(vspec)?));
            }
            Ok(Expr::Let {
                vars,
                body: Box::new(named_field(&map, name, "in")?),
            })
        }

        "$map" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "as", "in"])?;
            Ok(Expr::Map {
                input: Box::new(named_field(&map, name, "input")?),
                var: iteration_var(&map)?,
                body: Box::new(named_field(&map, name, "in")?),
            })
        }

        "$filter" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "as", "cond", "limit"])?;
            Ok(Expr::Filter {
                input: Box::new(named_field(&map, name, "input")?),
                var: iteration_var(&map)?,
                cond: Box::new(named_field(&map, name, "cond")?),
                limit: optional_field(&map, "limit")?,
            })
        }

        "$reduce" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "initialValue", "in"])?;
            Ok(Expr::Reduce {
                input: Box::new(named_field(&map, name, "input")?),
                initial: Box::new(named_field(&map, name, "initialValue")?),
                body: Box::new(named_field(&map, name, "in")?),
            })
        }

        "$zip" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["inputs", "useLongestLength", "defaults"])?;
            let use_longest = matches!(map.get("useLongestLength"), Some(Value::Bool(true)));
            Ok(Expr::Zip {
                inputs: Box::new(named_field(&map, name, "inputs")?),
                use_longest_length: use_longest,
                defaults: optional_field(&map, "defaults")?,
            })
        }

        "$sortArray" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "sortBy"])?;
            let by = match map.get("sortBy") {
                Some(v) if v.is_number() => {
                    SortArrayBy::Value(sort_direction(v, "$sortArray")?)
                }
                Some(Value::Object(fields)) => {
                    let mut keys = Vec::with_capacity(fields.len());
                    for (field, dir) in fields {
                        keys.push((path::split(field), sort_direction(dir, "$sortArray")?));
                    }
                    SortArrayBy::Fields(keys)
                }
                _ => return Err(Error::bad_value("$sortArray requires 'sortBy'")),
            };
            Ok(Expr::SortArray {
                input: Box::new(named_field(&map, name, "input")?),
                by,
            })
        }

        "$firstN" | "$lastN" | "$minN" | "$maxN" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["n", "input"])?;
            Ok(Expr::PickN {
                op: name.to_string(),
                n: Box::new(named_field(&map, name, "n")?),
                input: Box::new(named_field(&map, name, "input")?),
            })
        }

        "$getField" => match arg {
            Value::String(_) => Ok(Expr::GetField {
                field: Box::new(Expr::Literal(arg.clone())),
                input: None,
            }),
            Value::Object(map) => {
                reject_unknown(map, name, &["field", "input"])?;
                Ok(Expr::GetField {
                    field: Box::new(named_field(map, name, "field")?),
                    input: optional_field(map, "input")?,
                })
            }
            _ => Err(Error::bad_value(
                "$getField requires a string or an object argument",
            )),
        },

        "$setField" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["field", "input", "value"])?;
            let field = match map.get("field") {
                Some(Value::String(s)) => s.clone(),
                _ => {
                    return Err(Error::bad_value(
                        "$setField requires 'field' to be a string constant",
                    ));
                }
            };
            Ok(Expr::SetField {
                field,
                input: Box::new(named_field(&map, name, "input")?),
                value: Box::new(named_field(&map, name, "value")?),
            })
        }

        "$dateFromParts" => {
            let map = named(arg, name)?;
            let iso = map.keys().any(|k| k.starts_with("iso"));
            let allowed: &[&str] = if iso {
                &["isoWeekYear", "isoWeek", "isoDayOfWeek", "hour", "minute", "second", "millisecond", "timezone"]
            } else {
                &["year", "month", "day", "hour", "minute", "second", "millisecond", "timezone"]
            };
            reject_unknown(&map, name, allowed)?;
            let mut parts = Vec::with_capacity(map.len());
            for (k, v) in &map {
                if k == "timezone" {
                    continue; // UTC only
                }
                parts.push((k.clone(), compile(v)?));
            }
            Ok(Expr::DateFromParts { iso, parts })
        }

        "$dateToParts" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["date", "iso8601", "timezone"])?;
            Ok(Expr::DateToParts {
                date: Box::new(named_field(&map, name, "date")?),
                iso8601: matches!(map.get("iso8601"), Some(Value::Bool(true))),
            })
        }

        "$dateAdd" | "$dateSubtract" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["startDate", "unit", "amount", "timezone"])?;
            Ok(Expr::DateArith {
                subtract: name == "$dateSubtract",
                start_date: Box::new(named_field(&map, name, "startDate")?),
                unit: Box::new(named_field(&map, name, "unit")?),
                amount: Box::new(named_field(&map, name, "amount")?),
            })
        }

        "$dateDiff" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["startDate", "endDate", "unit", "timezone", "startOfWeek"])?;
            Ok(Expr::DateDiff {
                start_date: Box::new(named_field(&map, name, "startDate")?),
                end_date: Box::new(named_field(&map, name, "endDate")?),
                unit: Box::new(named_field(&map, name, "unit")?),
            })
        }

        "$dateFromString" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["dateString", "timezone", "onError", "onNull"])?;
            Ok(Expr::DateFromString {
                date_string: Box::new(named_field(&map, name, "dateString")?),
                on_error: optional_field(&map, "onError")?,
                on_null: optional_field(&map, "onNull")?,
            })
        }

        "$dateToString" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["date", "format", "timezone", "onNull"])?;
            let format = match map.get("format") {
                Some(Value::String(f)) => Some(f.clone()),
                Some(_) => {
                    return Err(Error::bad_value("$dateToString requires 'format' to be a string"));
                }
                None => None,
            };
            Ok(Expr::DateToString {
                date: Box::new(named_field(&map, name, "date")?),
                format,
                on_null: optional_field(&map, "onNull")?,
            })
        }

        "$convert" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "to", "onError", "onNull"])?;
            Ok(Expr::Convert {
                input: Box::new(named_field(&map, name, "input")?),
                to: Box::new(named_field(&map, name, "to")?),
                on_error: optional_field(&map, "onError")?,
                on_null: optional_field(&map, "onNull")?,
            })
        }

        "$regexMatch" | "$regexFind" | "$regexFindAll" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "regex", "options"])?;
            Ok(Expr::RegexOp {
                op: name.to_string(),
                input: Box::new(named_field(&map, name, "input")?),
                regex: Box::new(named_field(&map, name, "regex")?),
                options: optional_field(&map, "options")?,
            })
        }

        "$replaceOne" | "$replaceAll" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "find", "replacement"])?;
            Ok(Expr::Replace {
                all: name == "$replaceAll",
                input: Box::new(named_field(&map, name, "input")?),
                find: Box::new(named_field(&map, name, "find")?),
                replacement: Box::new(named_field(&map, name, "replacement")?),
            })
        }

        "$trim" | "$ltrim" | "$rtrim" => {
            let map = named(arg, name)?;
            reject_unknown(&map, name, &["input", "chars"])?;
            Ok(Expr::Trim {
                op: name.to_string(),
                input: Box::new(named_field(&map, name, "input")?),
                chars: optional_field(&map, "chars")?,
            })
        }

        "$meta" => match arg {
            Value::String(s) => Ok(Expr::Meta(s.clone())),
            _ => Err(Error::bad_value("$meta requires a string argument")),
        },

        "$rand" => match arg {
            Value::Object(map) if map.is_empty() => Ok(Expr::Rand),
            _ => Err(Error::bad_value("$rand takes no arguments (use {})")),
        },

        "$not" => {
            let args = args_list(arg);
            if args.len() != 1 {
                return Err(arity_error(name, 1, args.len()));
            }
            Ok(Expr::Op {
                name: name.to_string(),
                args: vec![compile(args[0])?],
            })
        }

        _ => {
            let (min, max) = positional_arity(name).ok_or_else(|| {
                Error::bad_value(format!("Unrecognized expression '{}'", name))
            })?;
            let args = args_list(arg);
            if args.len() < min || args.len() > max {
                return Err(if min == max {
                    arity_error(name, min, args.len())
                } else {
                    Error::bad_value(format!(
                        "Expression {} takes between {} and {} arguments. {} were passed in.",
                        name,
                        min,
                        if max == usize::MAX { "many".to_string() } else { max.to_string() },
                        args.len()
                    ))
                });
            }
            let compiled: Result<Vec<Expr>> = args.into_iter().map(compile).collect();
            Ok(Expr::Op {
                name: name.to_string(),
                args: compiled?,
            })
        }
    }
}

fn iteration_var(map: &crate::value::Document) -> Result<String> {
    match map.get("as") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(Error::bad_value("'as' must be a non-empty string")),
        None => Ok("this".to_string()),
    }
}

fn sort_direction(v: &Value, op: &str) -> Result<i8> {
    match v.as_i64() {
        Some(1) => Ok(1),
        Some(-1) => Ok(-1),
        _ => Err(Error::bad_value(format!(
            "{} sort direction must be 1 or -1",
            op
        ))),
    }
}

fn arity_error(name: &str, expected: usize, got: usize) -> Error {
    Error::bad_value(format!(
        "Expression {} takes exactly {} arguments. {} were passed in.",
        name, expected, got
    ))
}

/// Arity bounds for the uniform positional operators. `usize::MAX` marks a
/// variadic upper bound. Operators with named-record argument shapes are
/// handled in `compile_operator` and deliberately absent here.
fn positional_arity(name: &str) -> Option<(usize, usize)> {
    const MANY: usize = usize::MAX;
    Some(match name {
        // arithmetic
        "$add" | "$multiply" => (1, MANY),
        "$subtract" | "$divide" | "$mod" | "$pow" | "$atan2" | "$log" => (2, 2),
        "$abs" | "$ceil" | "$floor" | "$sqrt" | "$exp" | "$ln" | "$log10" => (1, 1),
        "$round" | "$trunc" => (1, 2),
        // trigonometry
        "$sin" | "$cos" | "$tan" | "$asin" | "$acos" | "$atan" | "$sinh" | "$cosh"
        | "$tanh" | "$asinh" | "$acosh" | "$atanh" | "$degreesToRadians"
        | "$radiansToDegrees" => (1, 1),
        // comparison
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => (2, 2),
        "$not" => (1, 1),
        // strings
        "$concat" => (1, MANY),
        "$toUpper" | "$toLower" | "$strLenCP" | "$strLenBytes" => (1, 1),
        "$split" | "$strcasecmp" => (2, 2),
        "$substrCP" => (3, 3),
        "$indexOfCP" => (2, 4),
        // arrays
        "$arrayElemAt" | "$in" | "$setIsSubset" | "$setDifference" => (2, 2),
        "$slice" => (2, 3),
        "$concatArrays" | "$setUnion" | "$setIntersection" => (1, MANY),
        "$setEquals" => (2, MANY),
        "$size" | "$isArray" | "$first" | "$last" | "$reverseArray" | "$arrayToObject"
        | "$objectToArray" | "$allElementsTrue" | "$anyElementTrue" => (1, 1),
        "$indexOfArray" => (2, 4),
        "$range" => (2, 3),
        "$mergeObjects" => (1, MANY),
        // folds usable as plain expressions
        "$sum" | "$avg" | "$min" | "$max" | "$stdDevPop" | "$stdDevSamp" => (1, MANY),
        // dates (extraction)
        "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$second"
        | "$millisecond" | "$dayOfYear" | "$dayOfWeek" | "$week" | "$isoWeek"
        | "$isoWeekYear" | "$isoDayOfWeek" => (1, 1),
        // type inspection and conversion
        "$type" | "$isNumber" | "$toInt" | "$toLong" | "$toDouble" | "$toDecimal"
        | "$toBool" | "$toString" | "$toDate" => (1, 1),
        _ => return None,
    })
}
