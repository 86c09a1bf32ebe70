//! The query-predicate grammar: the separate matching language used by
//! `$match`, `find`, `$elemMatch`, `$lookup` sub-pipelines and
//! `partialFilterExpression`.
//!
//! Predicates compile once into a [`Predicate`] tree; matching is
//! array-aware: a scalar condition on a path matches when the resolved
//! value satisfies it or, if the value is an array, when any element does.

use regex::Regex;

use crate::error::{Error, Result};
use crate::eval::EvalCtx;
use crate::expr::{self, Expr};
use crate::path;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Nor(Vec<Predicate>),
    Expr(Expr),
    Field { path: Vec<String>, conds: Vec<FieldCond> },
}

#[derive(Debug, Clone)]
pub enum FieldCond {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<InMember>),
    Nin(Vec<InMember>),
    Exists(bool),
    Type(Vec<String>),
    Regex(CompiledRegex),
    All(Vec<InMember>),
    ElemMatch(ElemMatchKind),
    Size(i64),
    Mod { divisor: i64, remainder: i64 },
    Bits { op: BitsOp, positions: Vec<u32> },
    Not(Vec<FieldCond>),
}

#[derive(Debug, Clone)]
pub enum InMember {
    Value(Value),
    Regex(CompiledRegex),
}

#[derive(Debug, Clone)]
pub enum ElemMatchKind {
    /// `{$gt: 5, $lt: 9}` — conditions on the element itself
    Conds(Vec<FieldCond>),
    /// `{state: "ok"}` — a full predicate over object elements
    Predicate(Box<Predicate>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BitsOp {
    AllSet,
    AllClear,
    AnySet,
    AnyClear,
}

#[derive(Debug, Clone)]
pub struct CompiledRegex {
    pub pattern: String,
    pub options: String,
    re: Regex,
}

impl CompiledRegex {
    pub fn new(pattern: &str, options: &str) -> Result<CompiledRegex> {
        // `g` is a deliberate non-flag here, like every flag outside imsx.
        let re = crate::eval::string::build_regex(pattern, options)?;
        Ok(CompiledRegex {
            pattern: pattern.to_string(),
            options: options.to_string(),
            re,
        })
    }

    fn matches(&self, s: &str) -> bool {
        self.re.is_match(s)
    }
}

// ========================================
// Compilation
// ========================================

/// Compile a query document into a predicate tree. An object is the
/// implicit AND of its entries.
pub fn compile(query: &Value) -> Result<Predicate> {
    let Value::Object(doc) = query else {
        return Err(Error::bad_value("a query filter must be an object"));
    };
    let mut clauses = Vec::with_capacity(doc.len());
    for (key, spec) in doc {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let Value::Array(items) = spec else {
                    return Err(Error::bad_value(format!("{} must be an array", key)));
                };
                if items.is_empty() {
                    return Err(Error::bad_value(format!(
                        "{} must be a nonempty array",
                        key
                    )));
                }
                let inner: Result<Vec<Predicate>> = items.iter().map(compile).collect();
                let inner = inner?;
                clauses.push(match key.as_str() {
                    "$and" => Predicate::And(inner),
                    "$or" => Predicate::Or(inner),
                    _ => Predicate::Nor(inner),
                });
            }
            "$expr" => clauses.push(Predicate::Expr(expr::compile(spec)?)),
            // Parsed and ignored; the rest of the query still applies.
            "$comment" => {}
            other if other.starts_with('$') => {
                return Err(Error::bad_value(format!(
                    "unknown top level operator: {}",
                    other
                )));
            }
            field => clauses.push(compile_field(field, spec)?),
        }
    }
    Ok(match clauses.len() {
        1 => clauses.pop().unwrap(),
        _ => Predicate::And(clauses),
    })
}

fn is_operator_doc(spec: &Value) -> bool {
    match spec {
        Value::Object(doc) => !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn compile_field(field: &str, spec: &Value) -> Result<Predicate> {
    let conds = if is_operator_doc(spec) {
        compile_conds(spec.as_object().unwrap())?
    } else {
        match spec {
            Value::Regex { pattern, options } => {
                vec![FieldCond::Regex(CompiledRegex::new(pattern, options)?)]
            }
            other => vec![FieldCond::Eq(other.clone())],
        }
    };
    Ok(Predicate::Field {
        path: path::split(field),
        conds,
    })
}

fn compile_conds(doc: &crate::value::Document) -> Result<Vec<FieldCond>> {
    let mut conds = Vec::with_capacity(doc.len());
    let mut regex_spec: Option<(String, String)> = None;
    let mut options_spec: Option<String> = None;
    for (op, arg) in doc {
        match op.as_str() {
            "$eq" => conds.push(FieldCond::Eq(arg.clone())),
            "$ne" => conds.push(FieldCond::Ne(arg.clone())),
            "$gt" => conds.push(FieldCond::Gt(arg.clone())),
            "$gte" => conds.push(FieldCond::Gte(arg.clone())),
            "$lt" => conds.push(FieldCond::Lt(arg.clone())),
            "$lte" => conds.push(FieldCond::Lte(arg.clone())),
            "$in" => conds.push(FieldCond::In(compile_members(arg, "$in")?)),
            "$nin" => conds.push(FieldCond::Nin(compile_members(arg, "$nin")?)),
            "$exists" => conds.push(FieldCond::Exists(arg.is_truthy())),
            "$type" => conds.push(FieldCond::Type(compile_types(arg)?)),
            "$regex" => {
                let (pattern, inline) = match arg {
                    Value::String(p) => (p.clone(), String::new()),
                    Value::Regex { pattern, options } => (pattern.clone(), options.clone()),
                    other => {
                        return Err(Error::bad_value(format!(
                            "$regex has to be a string or regular expression, found: {}",
                            other.type_name()
                        )));
                    }
                };
                regex_spec = Some((pattern, inline));
            }
            "$options" => match arg {
                Value::String(s) => options_spec = Some(s.clone()),
                _ => return Err(Error::bad_value("$options has to be a string")),
            },
            "$all" => conds.push(FieldCond::All(compile_members(arg, "$all")?)),
            "$elemMatch" => conds.push(FieldCond::ElemMatch(compile_elem_match(arg)?)),
            "$size" => {
                let n = arg
                    .as_i64()
                    .ok_or_else(|| Error::bad_value("$size needs a number"))?;
                if n < 0 {
                    return Err(Error::bad_value("$size may not be negative"));
                }
                conds.push(FieldCond::Size(n));
            }
            "$mod" => {
                let Value::Array(items) = arg else {
                    return Err(Error::bad_value("malformed mod, needs to be an array"));
                };
                if items.len() != 2 {
                    return Err(Error::bad_value(
                        "malformed mod, needs two elements (divisor and remainder)",
                    ));
                }
                let divisor = items[0]
                    .as_f64()
                    .map(|n| n.trunc() as i64)
                    .ok_or_else(|| Error::bad_value("malformed mod, divisor not a number"))?;
                let remainder = items[1]
                    .as_f64()
                    .map(|n| n.trunc() as i64)
                    .ok_or_else(|| Error::bad_value("malformed mod, remainder not a number"))?;
                if divisor == 0 {
                    return Err(Error::bad_value("divisor cannot be 0"));
                }
                conds.push(FieldCond::Mod { divisor, remainder });
            }
            "$bitsAllSet" | "$bitsAllClear" | "$bitsAnySet" | "$bitsAnyClear" => {
                let bits_op = match op.as_str() {
                    "$bitsAllSet" => BitsOp::AllSet,
                    "$bitsAllClear" => BitsOp::AllClear,
                    "$bitsAnySet" => BitsOp::AnySet,
                    _ => BitsOp::AnyClear,
                };
                conds.push(FieldCond::Bits {
                    op: bits_op,
                    positions: compile_bit_positions(arg, op)?,
                });
            }
            "$not" => {
                let inner = match arg {
                    Value::Regex { pattern, options } => {
                        vec![FieldCond::Regex(CompiledRegex::new(pattern, options)?)]
                    }
                    _ if is_operator_doc(arg) => compile_conds(arg.as_object().unwrap())?,
                    _ => {
                        return Err(Error::bad_value("$not needs a regex or a document"));
                    }
                };
                conds.push(FieldCond::Not(inner));
            }
            other => {
                return Err(Error::bad_value(format!("unknown operator: {}", other)));
            }
        }
    }
    match (regex_spec, options_spec) {
        (Some((pattern, inline)), Some(explicit)) => {
            if !inline.is_empty() {
                return Err(Error::bad_value(
                    "options set in both $regex and $options",
                ));
            }
            conds.push(FieldCond::Regex(CompiledRegex::new(&pattern, &explicit)?));
        }
        (Some((pattern, inline)), None) => {
            conds.push(FieldCond::Regex(CompiledRegex::new(&pattern, &inline)?));
        }
        (None, Some(_)) => {
            return Err(Error::bad_value("$options needs a $regex"));
        }
        (None, None) => {}
    }
    Ok(conds)
}

fn compile_members(arg: &Value, op: &str) -> Result<Vec<InMember>> {
    let Value::Array(items) = arg else {
        return Err(Error::bad_value(format!("{} needs an array", op)));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Regex { pattern, options } => {
                Ok(InMember::Regex(CompiledRegex::new(pattern, options)?))
            }
            other => Ok(InMember::Value(other.clone())),
        })
        .collect()
}

fn compile_types(arg: &Value) -> Result<Vec<String>> {
    let one = |v: &Value| -> Result<String> {
        match v {
            Value::String(s) => Ok(s.clone()),
            n if n.is_number() => Ok(match n.as_i64() {
                Some(1) => "double",
                Some(2) => "string",
                Some(3) => "object",
                Some(4) => "array",
                Some(5) => "binData",
                Some(8) => "bool",
                Some(9) => "date",
                Some(10) => "null",
                Some(11) => "regex",
                Some(16) => "int",
                Some(18) => "long",
                Some(19) => "decimal",
                _ => return Err(Error::bad_value("Invalid numerical type code for $type")),
            }
            .to_string()),
            _ => Err(Error::bad_value("$type needs a string or number alias")),
        }
    };
    match arg {
        Value::Array(items) => items.iter().map(one).collect(),
        other => Ok(vec![one(other)?]),
    }
}

fn compile_elem_match(arg: &Value) -> Result<ElemMatchKind> {
    let Value::Object(doc) = arg else {
        return Err(Error::bad_value("$elemMatch needs an object"));
    };
    if is_operator_doc(arg) && !doc.keys().any(|k| k == "$expr") {
        Ok(ElemMatchKind::Conds(compile_conds(doc)?))
    } else {
        Ok(ElemMatchKind::Predicate(Box::new(compile(arg)?)))
    }
}

/// A bitmask spec is either a non-negative integer mask or an array of
/// non-negative bit positions.
fn compile_bit_positions(arg: &Value, op: &str) -> Result<Vec<u32>> {
    match arg {
        Value::Array(items) => {
            let mut positions = Vec::with_capacity(items.len());
            for item in items {
                let position = item
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        Error::bad_value(format!("{} bit positions must be >= 0", op))
                    })?;
                positions.push(position.min(u32::MAX as i64) as u32);
            }
            Ok(positions)
        }
        other => {
            let mask = other
                .as_i64()
                .filter(|n| *n >= 0)
                .ok_or_else(|| {
                    Error::bad_value(format!(
                        "{} takes a non-negative bitmask or an array of bit positions",
                        op
                    ))
                })?;
            Ok((0..64).filter(|bit| mask & (1 << bit) != 0).collect())
        }
    }
}

// ========================================
// Matching
// ========================================

/// Evaluate a compiled predicate against a document. The context carries
/// `$$NOW` and any join variables visible to `$expr`.
pub fn matches(pred: &Predicate, doc: &Value, ctx: &EvalCtx) -> Result<bool> {
    match pred {
        Predicate::And(inner) => {
            for p in inner {
                if !matches(p, doc, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Or(inner) => {
            for p in inner {
                if matches(p, doc, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Predicate::Nor(inner) => {
            for p in inner {
                if matches(p, doc, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Expr(expr) => Ok(ctx.eval_on(expr, doc.clone())?.is_truthy()),
        Predicate::Field { path: segments, conds } => {
            let mut candidates = Vec::new();
            path::gather(doc, segments, &mut candidates);
            if candidates.is_empty() {
                candidates.push(Value::Missing);
            }
            for cond in conds {
                if !cond_matches(cond, &candidates, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

/// Test a condition against every candidate: the candidate itself and,
/// for scalar-style conditions, each element of an array candidate.
fn any_leaf(candidates: &[Value], test: impl Fn(&Value) -> bool) -> bool {
    candidates.iter().any(|candidate| {
        if test(candidate) {
            return true;
        }
        match candidate {
            Value::Array(items) => items.iter().any(&test),
            _ => false,
        }
    })
}

fn cond_matches(cond: &FieldCond, candidates: &[Value], ctx: &EvalCtx) -> Result<bool> {
    Ok(match cond {
        FieldCond::Eq(target) => any_leaf(candidates, |v| eq_with_null(v, target)),
        FieldCond::Ne(target) => !any_leaf(candidates, |v| eq_with_null(v, target)),
        FieldCond::Gt(target) => any_leaf(candidates, |v| ordered(v, target).is_some_and(|o| o.is_gt())),
        FieldCond::Gte(target) => any_leaf(candidates, |v| ordered(v, target).is_some_and(|o| o.is_ge())),
        FieldCond::Lt(target) => any_leaf(candidates, |v| ordered(v, target).is_some_and(|o| o.is_lt())),
        FieldCond::Lte(target) => any_leaf(candidates, |v| ordered(v, target).is_some_and(|o| o.is_le())),
        FieldCond::In(members) => any_leaf(candidates, |v| member_matches(members, v)),
        FieldCond::Nin(members) => !any_leaf(candidates, |v| member_matches(members, v)),
        FieldCond::Exists(want) => {
            let exists = candidates.iter().any(|v| !v.is_missing());
            exists == *want
        }
        FieldCond::Type(names) => any_leaf(candidates, |v| type_matches(names, v)),
        FieldCond::Regex(re) => {
            any_leaf(candidates, |v| matches!(v, Value::String(s) if re.matches(s)))
        }
        FieldCond::All(members) => candidates.iter().any(|candidate| {
            members.iter().all(|member| match candidate {
                Value::Array(items) => {
                    items.iter().any(|item| single_member_matches(member, item))
                }
                scalar => single_member_matches(member, scalar),
            })
        }),
        FieldCond::ElemMatch(kind) => {
            let mut matched = false;
            for candidate in candidates {
                let Value::Array(items) = candidate else {
                    continue;
                };
                for item in items {
                    let hit = match kind {
                        ElemMatchKind::Conds(conds) => {
                            let element = std::slice::from_ref(item);
                            let mut all = true;
                            for c in conds {
                                if !cond_matches(c, element, ctx)? {
                                    all = false;
                                    break;
                                }
                            }
                            all
                        }
                        ElemMatchKind::Predicate(pred) => {
                            item.as_object().is_some() && matches(pred, item, ctx)?
                        }
                    };
                    if hit {
                        matched = true;
                        break;
                    }
                }
                if matched {
                    break;
                }
            }
            matched
        }
        FieldCond::Size(n) => candidates
            .iter()
            .any(|v| matches!(v, Value::Array(items) if items.len() as i64 == *n)),
        FieldCond::Mod { divisor, remainder } => any_leaf(candidates, |v| {
            v.as_f64()
                .is_some_and(|n| n.is_finite() && (n.trunc() as i64) % divisor == *remainder)
        }),
        FieldCond::Bits { op, positions } => {
            any_leaf(candidates, |v| bits_match(*op, positions, v))
        }
        FieldCond::Not(inner) => {
            for c in inner {
                if cond_matches(c, candidates, ctx)? {
                    return Ok(false);
                }
            }
            true
        }
    })
}

/// Equality for matching: `null` targets also match missing fields.
fn eq_with_null(candidate: &Value, target: &Value) -> bool {
    if target.is_null() && candidate.is_missing() {
        return true;
    }
    candidate == target
}

/// Ordered comparison for `$gt` and friends: values are only comparable
/// within the same type bracket (numbers cross subtypes, missing folds to
/// null).
fn ordered(candidate: &Value, target: &Value) -> Option<std::cmp::Ordering> {
    let candidate = match candidate {
        Value::Missing => &Value::Null,
        other => other,
    };
    if candidate.type_rank() != target.type_rank() {
        return None;
    }
    Some(candidate.compare(target))
}

fn member_matches(members: &[InMember], candidate: &Value) -> bool {
    members.iter().any(|m| single_member_matches(m, candidate))
}

fn single_member_matches(member: &InMember, candidate: &Value) -> bool {
    match member {
        InMember::Value(v) => eq_with_null(candidate, v),
        InMember::Regex(re) => matches!(candidate, Value::String(s) if re.matches(s)),
    }
}

fn type_matches(names: &[String], candidate: &Value) -> bool {
    if candidate.is_missing() {
        return false;
    }
    names.iter().any(|name| {
        name == candidate.type_name() || (name == "number" && candidate.is_number())
    })
}

/// Bit test against an integral value in two's complement; positions above
/// 63 read the sign extension.
fn bits_match(op: BitsOp, positions: &[u32], candidate: &Value) -> bool {
    let Some(n) = candidate.as_f64() else {
        return false;
    };
    if !n.is_finite() || n.fract() != 0.0 || n < i64::MIN as f64 || n > i64::MAX as f64 {
        return false;
    }
    let bits = n as i64;
    let bit_at = |position: u32| -> bool {
        if position < 64 {
            bits & (1i64 << position) != 0
        } else {
            bits < 0
        }
    };
    match op {
        BitsOp::AllSet => positions.iter().all(|p| bit_at(*p)),
        BitsOp::AllClear => positions.iter().all(|p| !bit_at(*p)),
        BitsOp::AnySet => positions.iter().any(|p| bit_at(*p)),
        BitsOp::AnyClear => positions.iter().any(|p| !bit_at(*p)),
    }
}
