//! Date operators. All computation is in UTC over epoch milliseconds.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};

use crate::error::{Error, Result};
use crate::value::{Document, Value};

fn to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::bad_value(format!("date value {} is out of range", ms)))
}

fn date_ms(v: &Value, op: &str) -> Result<Option<i64>> {
    match v {
        Value::Null | Value::Missing => Ok(None),
        Value::Date(ms) => Ok(Some(*ms)),
        other => Err(Error::type_mismatch(format!(
            "{}: can't convert from BSON type {} to Date",
            op,
            other.type_name()
        ))),
    }
}

/// `$year` .. `$isoDayOfWeek`.
pub fn extract(name: &str, v: &Value) -> Result<Value> {
    let Some(ms) = date_ms(v, name)? else {
        return Ok(Value::Null);
    };
    let dt = to_datetime(ms)?;
    let out = match name {
        "$year" => dt.year() as i64,
        "$month" => dt.month() as i64,
        "$dayOfMonth" => dt.day() as i64,
        "$hour" => dt.hour() as i64,
        "$minute" => dt.minute() as i64,
        "$second" => dt.second() as i64,
        "$millisecond" => dt.timestamp_subsec_millis() as i64,
        "$dayOfYear" => dt.ordinal() as i64,
        // 1..7 with Sunday = 1
        "$dayOfWeek" => dt.weekday().num_days_from_sunday() as i64 + 1,
        "$week" => sunday_week(dt.date_naive()),
        "$isoWeek" => dt.iso_week().week() as i64,
        "$isoWeekYear" => dt.iso_week().year() as i64,
        // 1..7 with Monday = 1
        "$isoDayOfWeek" => dt.weekday().number_from_monday() as i64,
        _ => return Err(Error::bad_value(format!("Unrecognized expression '{}'", name))),
    };
    Ok(Value::from_int(out))
}

/// Week of year with Sunday as the first day; days before the year's
/// first Sunday fall in week 0.
fn sunday_week(date: NaiveDate) -> i64 {
    let ordinal0 = date.ordinal0() as i64;
    let weekday = date.weekday().num_days_from_sunday() as i64;
    (ordinal0 + 7 - weekday) / 7
}

fn part_value(parts: &[(&str, Value)], name: &str) -> Option<Value> {
    parts
        .iter()
        .find(|(part, _)| *part == name)
        .map(|(_, v)| v.clone())
}

pub fn date_from_parts(iso: bool, parts: &[(&str, Value)]) -> Result<Value> {
    // Any null part nulls the whole construction.
    if parts.iter().any(|(_, v)| v.is_nullish()) {
        return Ok(Value::Null);
    }
    let int_part = |name: &str, default: i64| -> Result<i64> {
        match part_value(parts, name) {
            None => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| {
                Error::bad_value(format!(
                    "$dateFromParts requires '{}' to evaluate to an integer",
                    name
                ))
            }),
        }
    };
    let base = if iso {
        let iso_year = match part_value(parts, "isoWeekYear") {
            Some(v) => v.as_i64().ok_or_else(|| {
                Error::bad_value("$dateFromParts requires 'isoWeekYear' to evaluate to an integer")
            })?,
            None => return Err(Error::bad_value("$dateFromParts requires 'isoWeekYear'")),
        };
        check_year(iso_year)?;
        let week = int_part("isoWeek", 1)?;
        let day = int_part("isoDayOfWeek", 1)?;
        let week_one_monday = NaiveDate::from_isoywd_opt(iso_year as i32, 1, Weekday::Mon)
            .ok_or_else(|| Error::bad_value("$dateFromParts could not build the ISO date"))?;
        week_one_monday
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            + Duration::days((week - 1) * 7 + (day - 1))
    } else {
        let year = match part_value(parts, "year") {
            Some(v) => v.as_i64().ok_or_else(|| {
                Error::bad_value("$dateFromParts requires 'year' to evaluate to an integer")
            })?,
            None => return Err(Error::bad_value("$dateFromParts requires 'year'")),
        };
        check_year(year)?;
        let month = int_part("month", 1)?;
        let day = int_part("day", 1)?;
        // Out-of-range month and day pivot into neighboring periods.
        let total_months = year * 12 + (month - 1);
        let (pivot_year, pivot_month) = (total_months.div_euclid(12), total_months.rem_euclid(12) + 1);
        let first = NaiveDate::from_ymd_opt(pivot_year as i32, pivot_month as u32, 1)
            .ok_or_else(|| Error::bad_value("$dateFromParts could not build the date"))?;
        first.and_hms_opt(0, 0, 0).expect("midnight is valid") + Duration::days(day - 1)
    };
    let shifted = base
        + Duration::hours(int_part("hour", 0)?)
        + Duration::minutes(int_part("minute", 0)?)
        + Duration::seconds(int_part("second", 0)?)
        + Duration::milliseconds(int_part("millisecond", 0)?);
    Ok(Value::Date(shifted.and_utc().timestamp_millis()))
}

fn check_year(year: i64) -> Result<()> {
    if (1..=9999).contains(&year) {
        Ok(())
    } else {
        Err(Error::bad_value(format!(
            "$dateFromParts requires a year in the range 1 to 9999, found {}",
            year
        )))
    }
}

pub fn date_to_parts(v: &Value, iso: bool) -> Result<Value> {
    let Some(ms) = date_ms(v, "$dateToParts")? else {
        return Ok(Value::Null);
    };
    let dt = to_datetime(ms)?;
    let mut doc = Document::new();
    if iso {
        doc.insert("isoWeekYear".to_string(), Value::from_int(dt.iso_week().year() as i64));
        doc.insert("isoWeek".to_string(), Value::from_int(dt.iso_week().week() as i64));
        doc.insert(
            "isoDayOfWeek".to_string(),
            Value::from_int(dt.weekday().number_from_monday() as i64),
        );
    } else {
        doc.insert("year".to_string(), Value::from_int(dt.year() as i64));
        doc.insert("month".to_string(), Value::from_int(dt.month() as i64));
        doc.insert("day".to_string(), Value::from_int(dt.day() as i64));
    }
    doc.insert("hour".to_string(), Value::from_int(dt.hour() as i64));
    doc.insert("minute".to_string(), Value::from_int(dt.minute() as i64));
    doc.insert("second".to_string(), Value::from_int(dt.second() as i64));
    doc.insert(
        "millisecond".to_string(),
        Value::from_int(dt.timestamp_subsec_millis() as i64),
    );
    Ok(Value::Object(doc))
}

pub(crate) fn unit_millis(unit: &str) -> Option<i64> {
    Some(match unit {
        "millisecond" => 1,
        "second" => 1_000,
        "minute" => 60_000,
        "hour" => 3_600_000,
        "day" => 86_400_000,
        "week" => 7 * 86_400_000,
        _ => return None,
    })
}

/// Shift a date by whole months, preserving day-of-month and letting
/// overflow spill into the following month (Feb 31 ⇒ Mar 3).
fn add_months(ms: i64, months: i64) -> Result<i64> {
    let dt = to_datetime(ms)?;
    let total = dt.year() as i64 * 12 + dt.month0() as i64 + months;
    let (year, month) = (total.div_euclid(12), total.rem_euclid(12) + 1);
    let first = NaiveDate::from_ymd_opt(year as i32, month as u32, 1)
        .ok_or_else(|| Error::bad_value("date arithmetic out of range"))?;
    let shifted = first.and_hms_opt(0, 0, 0).expect("midnight is valid")
        + Duration::days(dt.day() as i64 - 1)
        + Duration::hours(dt.hour() as i64)
        + Duration::minutes(dt.minute() as i64)
        + Duration::seconds(dt.second() as i64)
        + Duration::milliseconds(dt.timestamp_subsec_millis() as i64);
    Ok(shifted.and_utc().timestamp_millis())
}

pub fn date_arith(subtract: bool, start: &Value, unit: &Value, amount: &Value) -> Result<Value> {
    let op = if subtract { "$dateSubtract" } else { "$dateAdd" };
    if start.is_nullish() || unit.is_nullish() || amount.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Date(ms) = start else {
        return Err(Error::type_mismatch(format!(
            "{} requires 'startDate' to be a date, found: {}",
            op,
            start.type_name()
        )));
    };
    let Value::String(unit) = unit else {
        return Err(Error::bad_value(format!("{} requires 'unit' to be a string", op)));
    };
    let amount = amount
        .as_i64()
        .ok_or_else(|| Error::bad_value(format!("{} requires 'amount' to be an integer", op)))?;
    let amount = if subtract { -amount } else { amount };
    let shifted = match unit.as_str() {
        "year" => add_months(*ms, amount * 12)?,
        "month" => add_months(*ms, amount)?,
        other => match unit_millis(other) {
            Some(per) => ms.saturating_add(amount.saturating_mul(per)),
            None => {
                return Err(Error::bad_value(format!("{} found an unknown unit: {}", op, other)));
            }
        },
    };
    Ok(Value::Date(shifted))
}

/// `$dateDiff` counts unit boundaries crossed between the two dates.
pub fn date_diff(start: &Value, end: &Value, unit: &Value) -> Result<Value> {
    if start.is_nullish() || end.is_nullish() || unit.is_nullish() {
        return Ok(Value::Null);
    }
    let (Some(start_ms), Some(end_ms)) =
        (date_ms(start, "$dateDiff")?, date_ms(end, "$dateDiff")?)
    else {
        return Ok(Value::Null);
    };
    let Value::String(unit) = unit else {
        return Err(Error::bad_value("$dateDiff requires 'unit' to be a string"));
    };
    let diff = match unit.as_str() {
        "millisecond" => end_ms - start_ms,
        "second" | "minute" | "hour" => {
            let per = unit_millis(unit).expect("unit handled above");
            end_ms.div_euclid(per) - start_ms.div_euclid(per)
        }
        "day" => {
            let days = |ms: i64| to_datetime(ms).map(|dt| dt.date_naive().num_days_from_ce() as i64);
            days(end_ms)? - days(start_ms)?
        }
        "week" => {
            // Weeks start on Sunday.
            let week_start = |ms: i64| -> Result<i64> {
                let dt = to_datetime(ms)?;
                let date = dt.date_naive();
                Ok(date.num_days_from_ce() as i64
                    - date.weekday().num_days_from_sunday() as i64)
            };
            (week_start(end_ms)? - week_start(start_ms)?) / 7
        }
        "month" => {
            let months = |ms: i64| to_datetime(ms).map(|dt| dt.year() as i64 * 12 + dt.month0() as i64);
            months(end_ms)? - months(start_ms)?
        }
        "year" => {
            let years = |ms: i64| to_datetime(ms).map(|dt| dt.year() as i64);
            years(end_ms)? - years(start_ms)?
        }
        other => {
            return Err(Error::bad_value(format!("$dateDiff found an unknown unit: {}", other)));
        }
    };
    Ok(Value::Long(diff))
}

/// Parse an ISO-8601-ish date string. Used by `$dateFromString` and
/// `$toDate`.
pub fn parse_date_string(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(
            date.and_hms_opt(0, 0, 0)
                .expect("midnight is valid")
                .and_utc()
                .timestamp_millis(),
        );
    }
    None
}

pub fn date_from_string(input: &Value) -> Result<Value> {
    let Value::String(s) = input else {
        return Err(Error::conversion_failure(format!(
            "$dateFromString requires that 'dateString' be a string, found: {}",
            input.type_name()
        )));
    };
    match parse_date_string(s) {
        Some(ms) => Ok(Value::Date(ms)),
        None => Err(Error::conversion_failure(format!(
            "Error parsing date string '{}'",
            s
        ))),
    }
}

pub fn date_to_string(date: &Value, format: Option<&str>) -> Result<Value> {
    let Some(ms) = date_ms(date, "$dateToString")? else {
        return Ok(Value::Null);
    };
    let dt = to_datetime(ms)?;
    let format = format.unwrap_or("%Y-%m-%dT%H:%M:%S.%LZ");
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", dt.year())),
            Some('m') => out.push_str(&format!("{:02}", dt.month())),
            Some('d') => out.push_str(&format!("{:02}", dt.day())),
            Some('H') => out.push_str(&format!("{:02}", dt.hour())),
            Some('M') => out.push_str(&format!("{:02}", dt.minute())),
            Some('S') => out.push_str(&format!("{:02}", dt.second())),
            Some('L') => out.push_str(&format!("{:03}", dt.timestamp_subsec_millis())),
            Some('j') => out.push_str(&format!("{:03}", dt.ordinal())),
            Some('w') => out.push_str(&(dt.weekday().num_days_from_sunday() + 1).to_string()),
            Some('u') => out.push_str(&dt.weekday().number_from_monday().to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                return Err(Error::bad_value(format!(
                    "$dateToString found an invalid format character '%{}'",
                    other
                )));
            }
            None => {
                return Err(Error::bad_value(
                    "$dateToString format string ends with an unescaped '%'",
                ));
            }
        }
    }
    Ok(Value::String(out))
}
