//! `$type`, `$isNumber`, `$convert` and the `$to*` shorthands.

use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::error::{Error, Result};
use crate::eval::date;
use crate::value::{Value, decimal_from_f64};

pub fn apply(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "$type" => Ok(Value::String(args[0].type_name().to_string())),
        "$isNumber" => Ok(Value::Bool(args[0].is_number())),
        _ => {
            let target = &name[3..]; // "$toInt" -> "Int"
            let target = target[..1].to_lowercase() + &target[1..];
            if args[0].is_nullish() {
                return Ok(Value::Null);
            }
            convert(&args[0], &Value::String(target))
        }
    }
}

/// `$convert` — the `to` value is a type name string or its numeric code.
pub fn convert(input: &Value, to: &Value) -> Result<Value> {
    let target = match to {
        Value::String(s) => s.clone(),
        v if v.is_number() => match v.as_i64() {
            Some(1) => "double".to_string(),
            Some(2) => "string".to_string(),
            Some(8) => "bool".to_string(),
            Some(9) => "date".to_string(),
            Some(16) => "int".to_string(),
            Some(18) => "long".to_string(),
            Some(19) => "decimal".to_string(),
            _ => {
                return Err(Error::bad_value("$convert found an unknown numeric type code"));
            }
        },
        other => {
            return Err(Error::bad_value(format!(
                "$convert requires 'to' to be a string or number, found: {}",
                other.type_name()
            )));
        }
    };
    match target.as_str() {
        "int" => to_integer(input, true),
        "long" => to_integer(input, false),
        "double" => to_double(input),
        "decimal" => to_decimal(input),
        "bool" => Ok(to_bool(input)),
        "string" => to_string(input),
        "date" => to_date(input),
        other => Err(Error::bad_value(format!(
            "$convert found an unknown type name: {}",
            other
        ))),
    }
}

/// Parse a numeric string the way `$toInt`/`$toDouble` expect: full
/// double syntax including scientific notation and infinities.
fn parse_number(s: &str) -> Result<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| Error::failed_to_parse(format!("number '{}' in $convert", s)))
}

fn int_result(n: i64, narrow: bool, op: &str) -> Result<Value> {
    if narrow {
        i32::try_from(n)
            .map(Value::Int)
            .map_err(|_| Error::conversion_failure(format!("conversion to {} would overflow", op)))
    } else {
        Ok(Value::Long(n))
    }
}

fn to_integer(input: &Value, narrow: bool) -> Result<Value> {
    let op = if narrow { "int" } else { "long" };
    match input {
        Value::Int(n) => int_result(*n as i64, narrow, op),
        Value::Long(n) => int_result(*n, narrow, op),
        Value::Double(n) => {
            if !n.is_finite() {
                return Err(Error::conversion_failure(format!(
                    "Attempt to convert infinity or NaN to {}",
                    op
                )));
            }
            // Truncation toward zero.
            let truncated = n.trunc();
            if truncated < i64::MIN as f64 || truncated > i64::MAX as f64 {
                return Err(Error::conversion_failure(format!(
                    "conversion to {} would overflow",
                    op
                )));
            }
            int_result(truncated as i64, narrow, op)
        }
        Value::Decimal(d) => {
            let truncated = d.trunc();
            match truncated.to_i64() {
                Some(n) => int_result(n, narrow, op),
                None => Err(Error::conversion_failure(format!(
                    "conversion to {} would overflow",
                    op
                ))),
            }
        }
        Value::Bool(b) => Ok(if narrow {
            Value::Int(*b as i32)
        } else {
            Value::Long(*b as i64)
        }),
        Value::String(s) => {
            let parsed = parse_number(s)?;
            if !parsed.is_finite() {
                return Err(Error::failed_to_parse(format!(
                    "number '{}' in $convert",
                    s
                )));
            }
            int_result(parsed.trunc() as i64, narrow, op)
        }
        Value::Date(ms) if !narrow => Ok(Value::Long(*ms)),
        other => Err(Error::conversion_failure(format!(
            "Unsupported conversion from {} to {}",
            other.type_name(),
            op
        ))),
    }
}

fn to_double(input: &Value) -> Result<Value> {
    match input {
        Value::Int(n) => Ok(Value::Double(*n as f64)),
        Value::Long(n) => Ok(Value::Double(*n as f64)),
        Value::Double(_) => Ok(input.clone()),
        Value::Decimal(d) => Ok(Value::Double(d.to_f64().unwrap_or(f64::NAN))),
        Value::Bool(b) => Ok(Value::Double(*b as i32 as f64)),
        Value::String(s) => Ok(Value::Double(parse_number(s)?)),
        Value::Date(ms) => Ok(Value::Double(*ms as f64)),
        other => Err(Error::conversion_failure(format!(
            "Unsupported conversion from {} to double",
            other.type_name()
        ))),
    }
}

fn to_decimal(input: &Value) -> Result<Value> {
    match input {
        Value::Int(n) => Ok(Value::Decimal(Decimal::from(*n))),
        Value::Long(n) => Ok(Value::Decimal(Decimal::from(*n))),
        Value::Double(n) => decimal_from_f64(*n)
            .map(Value::Decimal)
            .ok_or_else(|| {
                Error::conversion_failure("conversion to decimal would overflow")
            }),
        Value::Decimal(_) => Ok(input.clone()),
        Value::Bool(b) => Ok(Value::Decimal(Decimal::from(*b as i32))),
        Value::String(s) => s
            .trim()
            .parse::<Decimal>()
            .map(Value::Decimal)
            .map_err(|_| Error::failed_to_parse(format!("number '{}' in $convert", s))),
        Value::Date(ms) => Ok(Value::Decimal(Decimal::from(*ms))),
        other => Err(Error::conversion_failure(format!(
            "Unsupported conversion from {} to decimal",
            other.type_name()
        ))),
    }
}

/// `$toBool` — numbers are true unless zero (NaN included), and any
/// string, even the empty one, is true.
fn to_bool(input: &Value) -> Value {
    match input {
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(n) => Value::Bool(*n != 0),
        Value::Long(n) => Value::Bool(*n != 0),
        Value::Double(n) => Value::Bool(*n != 0.0),
        Value::Decimal(d) => Value::Bool(!d.is_zero()),
        _ => Value::Bool(true),
    }
}

fn to_string(input: &Value) -> Result<Value> {
    match input {
        Value::String(_) => Ok(input.clone()),
        Value::Int(n) => Ok(Value::String(n.to_string())),
        Value::Long(n) => Ok(Value::String(n.to_string())),
        Value::Double(n) => Ok(Value::String(n.to_string())),
        Value::Decimal(d) => Ok(Value::String(d.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        Value::Date(_) => date::date_to_string(input, None),
        other => Err(Error::conversion_failure(format!(
            "Unsupported conversion from {} to string",
            other.type_name()
        ))),
    }
}

fn to_date(input: &Value) -> Result<Value> {
    match input {
        Value::Date(_) => Ok(input.clone()),
        Value::Long(ms) => Ok(Value::Date(*ms)),
        Value::Double(n) if n.is_finite() => Ok(Value::Date(n.trunc() as i64)),
        Value::Decimal(d) => d
            .trunc()
            .to_i64()
            .map(Value::Date)
            .ok_or_else(|| Error::conversion_failure("conversion to date would overflow")),
        Value::String(s) => match date::parse_date_string(s) {
            Some(ms) => Ok(Value::Date(ms)),
            None => Err(Error::conversion_failure(format!(
                "Error parsing date string '{}'",
                s
            ))),
        },
        other => Err(Error::conversion_failure(format!(
            "can't convert from BSON type {} to Date",
            other.type_name()
        ))),
    }
}
