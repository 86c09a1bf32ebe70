use crate::value::{Document, Value};

/// Split a dotted field path into its segments.
///
/// Fields whose names literally contain a dot are not reachable through
/// dotted paths (only through `$getField`), so a plain split is the whole
/// grammar.
pub fn split(path: &str) -> Vec<String> {
    path.split('.').map(|s| s.to_string()).collect()
}

fn array_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || segment.starts_with('+') {
        return None;
    }
    // Only non-negative integer literals index arrays; "01" is fine, "-1"
    // and "1.5" are field names.
    segment.parse::<usize>().ok()
}

/// Resolve a dotted path against a value.
///
/// - The empty path returns the value itself.
/// - On an object the first segment names a field; absent fields resolve
///   to `Missing`.
/// - On an array, an integer segment indexes by position; any other
///   segment resolves the remaining path against each element and returns
///   an array of the results with `Missing` dropped.
/// - Everything else (scalars with a remaining path) resolves to `Missing`.
pub fn resolve(value: &Value, segments: &[String]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(doc) => match doc.get(first.as_str()) {
            Some(inner) => resolve(inner, rest),
            None => Value::Missing,
        },
        Value::Array(items) => {
            if let Some(idx) = array_index(first) {
                match items.get(idx) {
                    Some(inner) => resolve(inner, rest),
                    None => Value::Missing,
                }
            } else {
                let mut out = Vec::new();
                for item in items {
                    let resolved = resolve(item, segments);
                    if !resolved.is_missing() {
                        out.push(resolved);
                    }
                }
                Value::Array(out)
            }
        }
        _ => Value::Missing,
    }
}

/// Resolve for `$sort` keys: `Missing` ranks as `Null`.
pub fn resolve_for_sort(value: &Value, segments: &[String]) -> Value {
    match resolve(value, segments) {
        Value::Missing => Value::Null,
        v => v,
    }
}

/// Collect every candidate value a query predicate should consider for a
/// path: walks into arrays at intermediate segments, keeps the terminal
/// value whole (the matcher itself decides whether to also test array
/// elements). No candidates means the field is missing everywhere.
pub fn gather(value: &Value, segments: &[String], out: &mut Vec<Value>) {
    let Some((first, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Value::Object(doc) => {
            if let Some(inner) = doc.get(first.as_str()) {
                gather(inner, rest, out);
            }
        }
        Value::Array(items) => {
            if let Some(idx) = array_index(first) {
                if let Some(inner) = items.get(idx) {
                    gather(inner, rest, out);
                }
            }
            for item in items {
                if item.as_object().is_some() {
                    gather(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Set a value at a dotted path, creating intermediate objects as needed.
/// Arrays along the path distribute the write over their elements;
/// non-object values in the way are replaced by fresh objects.
pub fn set_path(doc: &mut Document, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        doc.insert(first.clone(), value);
        return;
    }
    let slot = doc
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Document::new()));
    set_in_value(slot, rest, value);
}

fn set_in_value(slot: &mut Value, segments: &[String], value: Value) {
    match slot {
        Value::Object(inner) => set_path(inner, segments, value),
        Value::Array(items) => {
            for item in items {
                set_in_value(item, segments, value.clone());
            }
        }
        other => {
            let mut fresh = Document::new();
            set_path(&mut fresh, segments, value);
            *other = Value::Object(fresh);
        }
    }
}

/// Remove the field at a dotted path. Arrays along the path distribute the
/// removal over their object elements. Missing intermediates are a no-op.
pub fn remove_path(doc: &mut Document, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        doc.shift_remove(first.as_str());
        return;
    }
    if let Some(slot) = doc.get_mut(first.as_str()) {
        remove_in_value(slot, rest);
    }
}

fn remove_in_value(slot: &mut Value, segments: &[String]) {
    match slot {
        Value::Object(inner) => remove_path(inner, segments),
        Value::Array(items) => {
            for item in items {
                remove_in_value(item, segments);
            }
        }
        _ => {}
    }
}
