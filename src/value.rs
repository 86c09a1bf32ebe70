use std::cmp::Ordering;

use indexmap::IndexMap;
use rust_decimal::{Decimal, prelude::FromPrimitive, prelude::ToPrimitive};

/// An ordered field-name → value mapping. Insertion order is preserved and
/// duplicate names are impossible by construction.
pub type Document = IndexMap<String, Value>;

/// A self-describing value as stored in documents and produced by the
/// aggregation engine.
///
/// The type carries a total order used by `$sort` and the comparison
/// operators: values of different tags order by tag rank, numbers compare
/// by numeric value regardless of subtype, and `Missing` is distinct from
/// (and sorts below) `Null`.
///
/// # Examples
///
/// ```
/// use nutmeg::Value;
///
/// let a = Value::Int(2);
/// let b = Value::Double(2.0);
/// assert_eq!(a, b); // numeric equality crosses subtypes
/// ```
#[derive(Debug, Clone)]
pub enum Value {
    /// The absent-field sentinel. Distinct from `Null`.
    Missing,

    /// Explicit null
    Null,

    /// 32-bit integer
    Int(i32),

    /// 64-bit integer
    Long(i64),

    /// IEEE-754 double
    Double(f64),

    /// High-precision decimal
    Decimal(Decimal),

    /// UTF-8 string
    String(String),

    /// Ordered field mapping
    Object(Document),

    /// Ordered sequence of values
    Array(Vec<Value>),

    /// Opaque bytes
    Binary(Vec<u8>),

    /// Boolean
    Bool(bool),

    /// Milliseconds since the Unix epoch (UTC)
    Date(i64),

    /// Regular expression pattern plus option flags
    Regex { pattern: String, options: String },
}

impl Value {
    /// External type name as reported by `$type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Binary(_) => "binData",
            Value::Bool(_) => "bool",
            Value::Date(_) => "date",
            Value::Regex { .. } => "regex",
        }
    }

    /// Rank used when comparing values of different tags.
    pub fn type_rank(&self) -> u8 {
        match self {
            Value::Missing => 0,
            Value::Null => 1,
            Value::Int(_) | Value::Long(_) | Value::Double(_) | Value::Decimal(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
            Value::Array(_) => 5,
            Value::Binary(_) => 6,
            Value::Bool(_) => 7,
            Value::Date(_) => 8,
            Value::Regex { .. } => 9,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null or Missing — the two absent-ish states most operators
    /// propagate as Null.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Missing)
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Long(_) | Value::Double(_) | Value::Decimal(_)
        )
    }

    /// Truthiness as used by `$and`, `$or`, `$not`, `$cond` and friends.
    /// Falsy: Null, Missing, false, numeric zero. Everything else —
    /// including the empty string and the empty array — is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Long(n) => *n != 0,
            Value::Double(n) => *n != 0.0,
            Value::Decimal(d) => !d.is_zero(),
            _ => true,
        }
    }

    /// Numeric value as a double, for any numeric subtype.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Long(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Exact integer value. Accepts Int, Long, and doubles/decimals that
    /// hold a whole number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n as i64),
            Value::Long(n) => Some(*n),
            Value::Double(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            Value::Decimal(d) if d.is_integer() => d.to_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Document> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Wrap an i64, shrinking to Int when the value fits in 32 bits.
    pub fn from_int(n: i64) -> Value {
        if let Ok(small) = i32::try_from(n) {
            Value::Int(small)
        } else {
            Value::Long(n)
        }
    }

    /// Total order over values: tag rank first, then per-tag comparison.
    /// NaN compares equal to NaN (sort stability) and below every other
    /// number. This is the order `$sort`, `$min`/`$max` and the comparison
    /// operators use.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (ra, rb) = (self.type_rank(), other.type_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Missing, Value::Missing) | (Value::Null, Value::Null) => Ordering::Equal,
            (a, b) if a.is_number() && b.is_number() => numeric_compare(a, b),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let key_ord = ka.as_bytes().cmp(kb.as_bytes());
                    if key_ord != Ordering::Equal {
                        return key_ord;
                    }
                    let val_ord = va.compare(vb);
                    if val_ord != Ordering::Equal {
                        return val_ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Array(a), Value::Array(b)) => {
                for (va, vb) in a.iter().zip(b.iter()) {
                    let ord = va.compare(vb);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (
                Value::Regex { pattern: pa, options: oa },
                Value::Regex { pattern: pb, options: ob },
            ) => pa.cmp(pb).then_with(|| oa.cmp(ob)),
            _ => Ordering::Equal,
        }
    }
}

/// Compare two numeric values by numeric value. Exact integer paths when
/// both sides are integral; decimals compare exactly against integers;
/// any double forces a double comparison. NaN equals NaN and sorts first.
fn numeric_compare(a: &Value, b: &Value) -> Ordering {
    use Value::*;
    match (a, b) {
        (Int(x), Int(y)) => x.cmp(y),
        (Int(x), Long(y)) => (*x as i64).cmp(y),
        (Long(x), Int(y)) => x.cmp(&(*y as i64)),
        (Long(x), Long(y)) => x.cmp(y),
        (Decimal(x), Decimal(y)) => x.cmp(y),
        (Decimal(x), Int(y)) => x.cmp(&rust_decimal::Decimal::from(*y)),
        (Int(x), Decimal(y)) => rust_decimal::Decimal::from(*x).cmp(y),
        (Decimal(x), Long(y)) => x.cmp(&rust_decimal::Decimal::from(*y)),
        (Long(x), Decimal(y)) => rust_decimal::Decimal::from(*x).cmp(y),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }
    }
}

/// Equality is the total order restricted to `Equal`, except that NaN is
/// never equal to anything (including itself).
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        let nan = |v: &Value| matches!(v, Value::Double(d) if d.is_nan());
        if nan(self) || nan(other) {
            return false;
        }
        self.compare(other) == Ordering::Equal
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Value {
        Value::Int(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Double(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Value {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Value {
        Value::Object(doc)
    }
}

// ========================================
// JSON interop
// ========================================

/// Convert a `serde_json::Value` into an engine value.
///
/// Integers that fit in 32 bits become `Int`, larger ones `Long`, floats
/// `Double`. A handful of extended-JSON spellings round-trip the tags JSON
/// cannot express: `{"$date": ms}`, `{"$regularExpression": {"pattern",
/// "options"}}`, `{"$numberDecimal": "..."}`, `{"$binary": "<hex>"}`.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from_int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Double(u as f64)
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::Number(n)) = map.get("$date") {
                    if let Some(ms) = n.as_i64() {
                        return Value::Date(ms);
                    }
                }
                if let Some(serde_json::Value::String(s)) = map.get("$numberDecimal") {
                    if let Ok(d) = s.parse::<Decimal>() {
                        return Value::Decimal(d);
                    }
                }
                if let Some(serde_json::Value::String(s)) = map.get("$binary") {
                    if let Some(bytes) = hex_decode(s) {
                        return Value::Binary(bytes);
                    }
                }
                if let Some(serde_json::Value::Object(re)) = map.get("$regularExpression") {
                    let pattern = re.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                    let options = re.get("options").and_then(|v| v.as_str()).unwrap_or("");
                    return Value::Regex {
                        pattern: pattern.to_string(),
                        options: options.to_string(),
                    };
                }
            }
            let mut doc = Document::new();
            for (k, v) in map {
                doc.insert(k.clone(), from_json(v));
            }
            Value::Object(doc)
        }
    }
}

/// Convert an engine value back to JSON. `Missing` has no JSON spelling
/// and serializes as null; the extended-JSON forms mirror [`from_json`].
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Missing | Value::Null => serde_json::Value::Null,
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Long(n) => serde_json::Value::from(*n),
        Value::Double(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Decimal(d) => serde_json::json!({ "$numberDecimal": d.to_string() }),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Object(doc) => {
            let mut map = serde_json::Map::new();
            for (k, v) in doc {
                map.insert(k.clone(), to_json(v));
            }
            serde_json::Value::Object(map)
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Binary(bytes) => serde_json::json!({ "$binary": hex_encode(bytes) }),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Date(ms) => serde_json::json!({ "$date": ms }),
        Value::Regex { pattern, options } => serde_json::json!({
            "$regularExpression": { "pattern": pattern, "options": options }
        }),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Build a `Decimal` from a double, used by the exact arithmetic paths.
pub fn decimal_from_f64(n: f64) -> Option<Decimal> {
    Decimal::from_f64(n)
}
