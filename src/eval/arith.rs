//! Arithmetic and trigonometric operators.
//!
//! Integer paths stay exact (with promotion to double on overflow), any
//! double operand promotes the computation, decimals stay decimal through
//! the exact operators. Rounding is half-to-even over `rust_decimal` so the
//! result never depends on the ambient floating-point rounding mode.

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};

use crate::error::{Error, Result};
use crate::value::{Value, decimal_from_f64};

fn numeric_error(op: &str, value: &Value) -> Error {
    Error::type_mismatch(format!(
        "{} only supports numeric types, not {}",
        op,
        value.type_name()
    ))
}

pub fn apply(name: &str, args: &[Value]) -> Result<Value> {
    // Null propagation happens before any type check.
    if args.iter().any(|a| a.is_nullish()) {
        return Ok(Value::Null);
    }
    match name {
        "$add" => add(args),
        "$subtract" => subtract(&args[0], &args[1]),
        "$multiply" => multiply(args),
        "$divide" => divide(&args[0], &args[1]),
        "$mod" => modulo(&args[0], &args[1]),
        "$abs" => abs(&args[0]),
        "$ceil" => ceil_floor(&args[0], true),
        "$floor" => ceil_floor(&args[0], false),
        "$round" => round(&args[0], args.get(1), RoundingStrategy::MidpointNearestEven, "$round"),
        "$trunc" => round(&args[0], args.get(1), RoundingStrategy::ToZero, "$trunc"),
        "$pow" => pow(&args[0], &args[1]),
        "$sqrt" => unary_double("$sqrt", &args[0], f64::sqrt),
        "$exp" => unary_double("$exp", &args[0], f64::exp),
        "$ln" => unary_double("$ln", &args[0], f64::ln),
        "$log" => log(&args[0], &args[1]),
        "$log10" => unary_double("$log10", &args[0], f64::log10),
        "$sin" => unary_double("$sin", &args[0], f64::sin),
        "$cos" => unary_double("$cos", &args[0], f64::cos),
        "$tan" => unary_double("$tan", &args[0], f64::tan),
        "$asin" => unary_double("$asin", &args[0], f64::asin),
        "$acos" => unary_double("$acos", &args[0], f64::acos),
        "$atan" => unary_double("$atan", &args[0], f64::atan),
        "$atan2" => atan2(&args[0], &args[1]),
        "$sinh" => unary_double("$sinh", &args[0], f64::sinh),
        "$cosh" => unary_double("$cosh", &args[0], f64::cosh),
        "$tanh" => unary_double("$tanh", &args[0], f64::tanh),
        "$asinh" => unary_double("$asinh", &args[0], f64::asinh),
        "$acosh" => unary_double("$acosh", &args[0], f64::acosh),
        "$atanh" => unary_double("$atanh", &args[0], f64::atanh),
        "$degreesToRadians" => unary_double("$degreesToRadians", &args[0], f64::to_radians),
        "$radiansToDegrees" => unary_double("$radiansToDegrees", &args[0], f64::to_degrees),
        _ => Err(Error::bad_value(format!("Unrecognized expression '{}'", name))),
    }
}

/// `$add` sums numbers, or numbers plus at most one date (yielding a
/// date shifted by the numeric sum of milliseconds).
fn add(args: &[Value]) -> Result<Value> {
    let mut date: Option<i64> = None;
    let mut acc = Value::Int(0);
    for arg in args {
        match arg {
            Value::Date(ms) => {
                if date.replace(*ms).is_some() {
                    return Err(Error::type_mismatch(
                        "only one date allowed in an $add expression",
                    ));
                }
            }
            v if v.is_number() => acc = add_pair(&acc, v),
            other => return Err(numeric_error("$add", other)),
        }
    }
    match date {
        Some(ms) => {
            let shift = acc.as_f64().unwrap_or(0.0);
            Ok(Value::Date(ms.saturating_add(shift as i64)))
        }
        None => Ok(acc),
    }
}

fn subtract(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Date(x), Value::Date(y)) => Ok(Value::Long(x - y)),
        (Value::Date(x), v) if v.is_number() => {
            let shift = v.as_f64().unwrap_or(0.0);
            Ok(Value::Date(x.saturating_sub(shift as i64)))
        }
        (x, y) if x.is_number() && y.is_number() => Ok(sub_pair(x, y)),
        (x, y) => Err(if x.is_number() || matches!(x, Value::Date(_)) {
            numeric_error("$subtract", y)
        } else {
            numeric_error("$subtract", x)
        }),
    }
}

fn multiply(args: &[Value]) -> Result<Value> {
    let mut acc = Value::Int(1);
    for arg in args {
        if !arg.is_number() {
            return Err(numeric_error("$multiply", arg));
        }
        acc = mul_pair(&acc, arg);
    }
    Ok(acc)
}

fn divide(a: &Value, b: &Value) -> Result<Value> {
    if !a.is_number() {
        return Err(numeric_error("$divide", a));
    }
    if !b.is_number() {
        return Err(numeric_error("$divide", b));
    }
    if matches!(b.as_f64(), Some(x) if x == 0.0) {
        return Err(Error::bad_value("can't $divide by zero"));
    }
    if matches!(a, Value::Decimal(_)) || matches!(b, Value::Decimal(_)) {
        if let (Some(da), Some(db)) = (to_decimal(a), to_decimal(b)) {
            if let Some(q) = da.checked_div(db) {
                return Ok(Value::Decimal(q));
            }
        }
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    Ok(Value::Double(x / y))
}

fn modulo(a: &Value, b: &Value) -> Result<Value> {
    if !a.is_number() {
        return Err(numeric_error("$mod", a));
    }
    if !b.is_number() {
        return Err(numeric_error("$mod", b));
    }
    if matches!(b.as_f64(), Some(x) if x == 0.0) {
        return Err(Error::bad_value("$mod by zero"));
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x % y)),
        (x, y) if integral(x) && integral(y) => {
            let xv = x.as_i64().unwrap_or(0);
            let yv = y.as_i64().unwrap_or(1);
            Ok(Value::Long(xv % yv))
        }
        (x, y) => {
            let xv = x.as_f64().unwrap_or(f64::NAN);
            let yv = y.as_f64().unwrap_or(f64::NAN);
            Ok(Value::Double(xv % yv))
        }
    }
}

fn integral(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Long(_))
}

fn to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Int(n) => Some(Decimal::from(*n)),
        Value::Long(n) => Some(Decimal::from(*n)),
        Value::Double(n) => decimal_from_f64(*n),
        Value::Decimal(d) => Some(*d),
        _ => None,
    }
}

fn decimal_result(d: Decimal) -> Value {
    Value::Decimal(d)
}

/// Sum of two numeric values with promotion: int paths exact, overflow
/// promotes to double (saturating to infinity by IEEE-754), any double
/// operand promotes, decimals stay decimal.
pub(crate) fn add_pair(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::from_int(*x as i64 + *y as i64),
        (x, y) if matches!(x, Value::Decimal(_)) || matches!(y, Value::Decimal(_)) => {
            match (to_decimal(x), to_decimal(y)) {
                (Some(dx), Some(dy)) => match dx.checked_add(dy) {
                    Some(sum) => decimal_result(sum),
                    None => Value::Double(x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0)),
                },
                _ => Value::Double(x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0)),
            }
        }
        (x, y) if integral(x) && integral(y) => {
            let xv = x.as_i64().unwrap_or(0);
            let yv = y.as_i64().unwrap_or(0);
            match xv.checked_add(yv) {
                Some(sum) => Value::Long(sum),
                None => Value::Double(xv as f64 + yv as f64),
            }
        }
        (x, y) => Value::Double(x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0)),
    }
}

fn sub_pair(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::from_int(*x as i64 - *y as i64),
        (x, y) if matches!(x, Value::Decimal(_)) || matches!(y, Value::Decimal(_)) => {
            match (to_decimal(x), to_decimal(y)) {
                (Some(dx), Some(dy)) => match dx.checked_sub(dy) {
                    Some(diff) => decimal_result(diff),
                    None => Value::Double(x.as_f64().unwrap_or(0.0) - y.as_f64().unwrap_or(0.0)),
                },
                _ => Value::Double(x.as_f64().unwrap_or(0.0) - y.as_f64().unwrap_or(0.0)),
            }
        }
        (x, y) if integral(x) && integral(y) => {
            let xv = x.as_i64().unwrap_or(0);
            let yv = y.as_i64().unwrap_or(0);
            match xv.checked_sub(yv) {
                Some(diff) => Value::Long(diff),
                None => Value::Double(xv as f64 - yv as f64),
            }
        }
        (x, y) => Value::Double(x.as_f64().unwrap_or(0.0) - y.as_f64().unwrap_or(0.0)),
    }
}

fn mul_pair(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::from_int(*x as i64 * *y as i64),
        (x, y) if matches!(x, Value::Decimal(_)) || matches!(y, Value::Decimal(_)) => {
            match (to_decimal(x), to_decimal(y)) {
                (Some(dx), Some(dy)) => match dx.checked_mul(dy) {
                    Some(product) => decimal_result(product),
                    None => Value::Double(x.as_f64().unwrap_or(0.0) * y.as_f64().unwrap_or(0.0)),
                },
                _ => Value::Double(x.as_f64().unwrap_or(0.0) * y.as_f64().unwrap_or(0.0)),
            }
        }
        (x, y) if integral(x) && integral(y) => {
            let xv = x.as_i64().unwrap_or(0);
            let yv = y.as_i64().unwrap_or(0);
            match xv.checked_mul(yv) {
                Some(product) => Value::Long(product),
                None => Value::Double(xv as f64 * yv as f64),
            }
        }
        (x, y) => Value::Double(x.as_f64().unwrap_or(0.0) * y.as_f64().unwrap_or(0.0)),
    }
}

fn abs(v: &Value) -> Result<Value> {
    match v {
        Value::Int(n) => Ok(Value::from_int((*n as i64).abs())),
        Value::Long(n) => match n.checked_abs() {
            Some(a) => Ok(Value::Long(a)),
            None => Err(Error::bad_value("can't take $abs of long long min")),
        },
        Value::Double(n) => Ok(Value::Double(n.abs())),
        Value::Decimal(d) => Ok(Value::Decimal(d.abs())),
        other => Err(numeric_error("$abs", other)),
    }
}

fn ceil_floor(v: &Value, up: bool) -> Result<Value> {
    let op = if up { "$ceil" } else { "$floor" };
    match v {
        Value::Int(_) | Value::Long(_) => Ok(v.clone()),
        Value::Double(n) => Ok(Value::Double(if up { n.ceil() } else { n.floor() })),
        Value::Decimal(d) => Ok(Value::Decimal(if up { d.ceil() } else { d.floor() })),
        other => Err(numeric_error(op, other)),
    }
}

/// `$round` / `$trunc` with an optional `places` argument anywhere in the
/// Int32 range. Negative places operate left of the decimal point.
fn round(
    v: &Value,
    places: Option<&Value>,
    strategy: RoundingStrategy,
    op: &str,
) -> Result<Value> {
    let places = match places {
        Some(p) => p
            .as_i64()
            .filter(|n| i32::try_from(*n).is_ok())
            .ok_or_else(|| {
                Error::bad_value(format!(
                    "{} requires 'places' to be an integer representable as a 32-bit value",
                    op
                ))
            })?,
        None => 0,
    };
    if !v.is_number() {
        return Err(numeric_error(op, v));
    }
    // Infinities and NaN round to themselves.
    if let Value::Double(n) = v {
        if !n.is_finite() {
            return Ok(v.clone());
        }
    }
    let decimal = to_decimal(v);
    let Some(decimal) = decimal else {
        return Ok(v.clone());
    };
    let rounded = round_decimal(decimal, places, strategy);
    match v {
        Value::Int(_) | Value::Long(_) => match rounded.to_i64() {
            Some(n) => Ok(Value::from_int(n)),
            None => Ok(Value::Double(rounded.to_f64().unwrap_or(f64::NAN))),
        },
        Value::Double(_) => Ok(Value::Double(rounded.to_f64().unwrap_or(f64::NAN))),
        Value::Decimal(_) => Ok(Value::Decimal(rounded)),
        _ => unreachable!("checked is_number above"),
    }
}

fn round_decimal(d: Decimal, places: i64, strategy: RoundingStrategy) -> Decimal {
    if places >= 0 {
        d.round_dp_with_strategy(places.min(28) as u32, strategy)
    } else {
        let magnitude = (-places).min(28) as u32;
        let mut scale = Decimal::ONE;
        for _ in 0..magnitude {
            scale *= Decimal::from(10);
        }
        match d.checked_div(scale) {
            Some(shifted) => {
                let rounded = shifted.round_dp_with_strategy(0, strategy);
                rounded.checked_mul(scale).unwrap_or(d)
            }
            None => d,
        }
    }
}

fn pow(base: &Value, exp: &Value) -> Result<Value> {
    if !base.is_number() {
        return Err(numeric_error("$pow", base));
    }
    if !exp.is_number() {
        return Err(numeric_error("$pow", exp));
    }
    let base_f = base.as_f64().unwrap_or(f64::NAN);
    let exp_f = exp.as_f64().unwrap_or(f64::NAN);
    if base_f == 0.0 && exp_f < 0.0 {
        return Err(Error::bad_value(
            "$pow cannot take a base of 0 and a negative exponent",
        ));
    }
    if integral(base) && integral(exp) {
        let exp_i = exp.as_i64().unwrap_or(0);
        if (0..=u32::MAX as i64).contains(&exp_i) {
            if let Some(result) = base.as_i64().and_then(|b| b.checked_pow(exp_i as u32)) {
                return Ok(Value::from_int(result));
            }
        }
    }
    Ok(Value::Double(base_f.powf(exp_f)))
}

fn log(x: &Value, base: &Value) -> Result<Value> {
    if !x.is_number() {
        return Err(numeric_error("$log", x));
    }
    if !base.is_number() {
        return Err(numeric_error("$log", base));
    }
    let xv = x.as_f64().unwrap_or(f64::NAN);
    let bv = base.as_f64().unwrap_or(f64::NAN);
    Ok(Value::Double(xv.log(bv)))
}

fn atan2(y: &Value, x: &Value) -> Result<Value> {
    if !y.is_number() {
        return Err(numeric_error("$atan2", y));
    }
    if !x.is_number() {
        return Err(numeric_error("$atan2", x));
    }
    Ok(Value::Double(
        y.as_f64().unwrap_or(f64::NAN).atan2(x.as_f64().unwrap_or(f64::NAN)),
    ))
}

/// Unary operators computed over doubles. Out-of-domain inputs yield NaN
/// by IEEE-754 rather than raising.
fn unary_double(op: &str, v: &Value, f: fn(f64) -> f64) -> Result<Value> {
    if !v.is_number() {
        return Err(numeric_error(op, v));
    }
    Ok(Value::Double(f(v.as_f64().unwrap_or(f64::NAN))))
}
