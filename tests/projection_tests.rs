use nutmeg::projection::{apply, apply_add_fields, compile, compile_add_fields};
use nutmeg::{Document, Error, EvalCtx, Value, from_json};
use serde_json::json;

fn doc(v: serde_json::Value) -> Document {
    match from_json(&v) {
        Value::Object(d) => d,
        other => panic!("expected an object, got {:?}", other),
    }
}

fn project(spec: serde_json::Value, input: serde_json::Value) -> Result<Document, Error> {
    let projection = compile(&from_json(&spec))?;
    apply(&projection, &doc(input), &EvalCtx::new(0))
}

fn project_ok(spec: serde_json::Value, input: serde_json::Value) -> Document {
    project(spec.clone(), input).unwrap_or_else(|e| panic!("{:?} failed: {}", spec, e))
}

fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, Error>, needle: &str) {
    match result {
        Ok(v) => panic!("expected an error containing '{}', got {:?}", needle, v),
        Err(e) => assert!(
            e.message.contains(needle),
            "expected error containing '{}', got: {}",
            needle,
            e.message
        ),
    }
}

#[test]
fn test_inclusion_keeps_only_listed_paths() {
    let out = project_ok(
        json!({"name": 1, "price": 1}),
        json!({"_id": 1, "name": "x", "price": 5, "qty": 9}),
    );
    assert_eq!(out, doc(json!({"_id": 1, "name": "x", "price": 5})));
}

#[test]
fn test_id_included_implicitly_unless_suppressed() {
    let out = project_ok(json!({"name": 1, "_id": 0}), json!({"_id": 1, "name": "x"}));
    assert_eq!(out, doc(json!({"name": "x"})));
}

#[test]
fn test_exclusion_removes_listed_paths() {
    let out = project_ok(
        json!({"qty": 0}),
        json!({"_id": 1, "name": "x", "qty": 9}),
    );
    assert_eq!(out, doc(json!({"_id": 1, "name": "x"})));
}

#[test]
fn test_mixing_inclusion_and_exclusion_errors() {
    assert_err_contains(project(json!({"a": 1, "b": 0}), json!({})), "exclusion");
}

#[test]
fn test_id_zero_is_allowed_with_inclusions() {
    // The single exception to the no-mixing rule.
    let out = project_ok(json!({"_id": 0, "a": 1}), json!({"_id": 9, "a": 1, "b": 2}));
    assert_eq!(out, doc(json!({"a": 1})));
}

#[test]
fn test_nested_inclusion_preserves_array_structure() {
    let out = project_ok(
        json!({"items.price": 1, "_id": 0}),
        json!({"_id": 1, "items": [{"price": 4, "x": 1}, {"price": 6}], "other": 1}),
    );
    assert_eq!(out, doc(json!({"items": [{"price": 4}, {"price": 6}]})));
}

#[test]
fn test_nested_spec_object_form() {
    // {a: {b: 1}} is the same projection as {"a.b": 1}.
    let out = project_ok(
        json!({"a": {"b": 1}, "_id": 0}),
        json!({"a": {"b": 5, "c": 6}, "z": 7}),
    );
    assert_eq!(out, doc(json!({"a": {"b": 5}})));
}

#[test]
fn test_nested_exclusion() {
    let out = project_ok(
        json!({"a.secret": 0}),
        json!({"_id": 1, "a": {"secret": "x", "open": "y"}}),
    );
    assert_eq!(out, doc(json!({"_id": 1, "a": {"open": "y"}})));
}

#[test]
fn test_computed_fields_evaluate_against_whole_document() {
    let out = project_ok(
        json!({"_id": 0, "total": {"$multiply": ["$price", "$qty"]}, "name": 1}),
        json!({"name": "w", "price": 3, "qty": 4}),
    );
    assert_eq!(out, doc(json!({"name": "w", "total": 12})));
}

#[test]
fn test_computed_missing_is_omitted() {
    let out = project_ok(
        json!({"_id": 0, "picked": {"$arrayElemAt": ["$xs", 9]}, "a": 1}),
        json!({"a": 1, "xs": [1]}),
    );
    assert_eq!(out, doc(json!({"a": 1})));
}

#[test]
fn test_empty_projection_errors() {
    assert_err_contains(project(json!({}), json!({})), "at least one field");
}

#[test]
fn test_add_fields_overlays_and_preserves() {
    let add = compile_add_fields(&from_json(&json!({"total": {"$add": ["$a", "$b"]}}))).unwrap();
    let out = apply_add_fields(&add, &doc(json!({"a": 1, "b": 2, "keep": true})), &EvalCtx::new(0))
        .unwrap();
    assert_eq!(out, doc(json!({"a": 1, "b": 2, "keep": true, "total": 3})));
}

#[test]
fn test_add_fields_later_fields_see_earlier_ones() {
    let add = compile_add_fields(&from_json(&json!({
        "doubled": {"$multiply": ["$x", 2]},
        "quadrupled": {"$multiply": ["$doubled", 2]}
    })))
    .unwrap();
    let out = apply_add_fields(&add, &doc(json!({"x": 3})), &EvalCtx::new(0)).unwrap();
    assert_eq!(out, doc(json!({"x": 3, "doubled": 6, "quadrupled": 12})));
}

#[test]
fn test_add_fields_nested_path() {
    let add = compile_add_fields(&from_json(&json!({"meta.tag": "new"}))).unwrap();
    let out = apply_add_fields(&add, &doc(json!({"meta": {"old": 1}})), &EvalCtx::new(0)).unwrap();
    assert_eq!(out, doc(json!({"meta": {"old": 1, "tag": "new"}})));
}

#[test]
fn test_add_fields_rejects_exclusion_values() {
    assert_err_contains(
        compile_add_fields(&from_json(&json!({"x": 0}))),
        "not an expression",
    );
}
