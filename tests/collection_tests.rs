use nutmeg::{Database, Document, Error, Value, from_json};
use serde_json::json;

fn doc(v: serde_json::Value) -> Document {
    match from_json(&v) {
        Value::Object(d) => d,
        other => panic!("expected an object, got {:?}", other),
    }
}

fn val(v: serde_json::Value) -> Value {
    from_json(&v)
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

fn assert_code<T: std::fmt::Debug>(result: Result<T, Error>, code: i32) {
    match result {
        Ok(v) => panic!("expected error code {}, got {:?}", code, v),
        Err(e) => assert_eq!(e.code, code, "unexpected code for: {}", e.message),
    }
}

// ========================================
// CRUD
// ========================================

#[test]
fn test_insert_and_find() {
    let mut db = Database::new();
    let mut users = db.collection("users");
    users.insert_one(doc(json!({"_id": 1, "name": "ann", "age": 31}))).unwrap();
    users.insert_one(doc(json!({"_id": 2, "name": "bob", "age": 25}))).unwrap();

    let adults = users.find(&val(json!({"age": {"$gte": 30}}))).unwrap().to_array();
    assert_eq!(adults, vec![doc(json!({"_id": 1, "name": "ann", "age": 31}))]);

    let bob = users.find_one(&val(json!({"name": "bob"}))).unwrap();
    assert_eq!(bob, Some(doc(json!({"_id": 2, "name": "bob", "age": 25}))));
}

#[test]
fn test_insert_generates_missing_id() {
    let mut db = Database::new();
    let id = db.collection("c").insert_one(doc(json!({"x": 1}))).unwrap();
    match &id {
        Value::String(s) => assert_eq!(s.len(), 24),
        other => panic!("expected a generated string id, got {:?}", other),
    }
    let found = db.collection("c").find_one(&val(json!({"x": 1}))).unwrap().unwrap();
    assert_eq!(found.get("_id"), Some(&id));
    // The generated _id lands first.
    assert_eq!(found.keys().next().map(|s| s.as_str()), Some("_id"));
}

#[test]
fn test_duplicate_id_is_error_11000() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1}))).unwrap();
    let result = c.insert_one(doc(json!({"_id": 1})));
    assert_code(result.clone(), 11000);
    assert_err_contains(result, "E11000 duplicate key error");
}

#[test]
fn test_insert_many_is_ordered() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    let result = c.insert_many(vec![
        doc(json!({"_id": 1})),
        doc(json!({"_id": 1})),
        doc(json!({"_id": 2})),
    ]);
    assert_code(result, 11000);
    // The first document landed before the failure; the third never ran.
    assert_eq!(c.estimated_document_count(), 1);
}

#[test]
fn test_update_one_operators() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1, "n": 5, "tags": ["a"]}))).unwrap();
    let result = c
        .update_one(
            &val(json!({"_id": 1})),
            &val(json!({"$inc": {"n": 3}, "$push": {"tags": "b"}, "$set": {"seen": true}})),
            false,
        )
        .unwrap();
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);
    assert_eq!(
        c.find_one(&val(json!({"_id": 1}))).unwrap().unwrap(),
        doc(json!({"_id": 1, "n": 8, "tags": ["a", "b"], "seen": true}))
    );
}

#[test]
fn test_update_many() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_many(vec![
        doc(json!({"_id": 1, "g": "x", "n": 1})),
        doc(json!({"_id": 2, "g": "x", "n": 2})),
        doc(json!({"_id": 3, "g": "y", "n": 3})),
    ])
    .unwrap();
    let result = c
        .update_many(&val(json!({"g": "x"})), &val(json!({"$mul": {"n": 10}})), false)
        .unwrap();
    assert_eq!(result.matched_count, 2);
    assert_eq!(result.modified_count, 2);
    let total: i64 = c
        .find(&val(json!({})))
        .unwrap()
        .to_array()
        .iter()
        .map(|d| d.get("n").unwrap().as_i64().unwrap())
        .sum();
    assert_eq!(total, 10 + 20 + 3);
}

#[test]
fn test_update_cannot_change_id() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1}))).unwrap();
    assert_err_contains(
        c.update_one(&val(json!({"_id": 1})), &val(json!({"$set": {"_id": 2}})), false),
        "immutable field '_id'",
    );
}

#[test]
fn test_upsert_seeds_from_filter_equalities() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    let result = c
        .update_one(
            &val(json!({"sku": "apple", "shelf": {"$eq": 3}})),
            &val(json!({"$inc": {"qty": 5}})),
            true,
        )
        .unwrap();
    assert!(result.upserted_id.is_some());
    let created = c.find_one(&val(json!({"sku": "apple"}))).unwrap().unwrap();
    assert_eq!(created.get("shelf"), Some(&Value::Int(3)));
    assert_eq!(created.get("qty"), Some(&Value::Int(5)));
}

#[test]
fn test_replace_one() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1, "old": true}))).unwrap();
    c.replace_one(&val(json!({"_id": 1})), &doc(json!({"fresh": true})), false).unwrap();
    assert_eq!(
        c.find_one(&val(json!({"_id": 1}))).unwrap().unwrap(),
        doc(json!({"_id": 1, "fresh": true}))
    );
    assert_err_contains(
        c.replace_one(&val(json!({"_id": 1})), &doc(json!({"$set": {"x": 1}})), false),
        "update operators",
    );
}

#[test]
fn test_delete() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_many(vec![
        doc(json!({"_id": 1, "g": "x"})),
        doc(json!({"_id": 2, "g": "x"})),
        doc(json!({"_id": 3, "g": "y"})),
    ])
    .unwrap();
    assert_eq!(c.delete_one(&val(json!({"g": "x"}))).unwrap(), 1);
    assert_eq!(c.delete_many(&val(json!({"g": "x"}))).unwrap(), 1);
    assert_eq!(c.estimated_document_count(), 1);
}

#[test]
fn test_count_documents_and_estimated() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_many(vec![
        doc(json!({"_id": 1, "n": 1})),
        doc(json!({"_id": 2, "n": 5})),
    ])
    .unwrap();
    assert_eq!(c.count_documents(&val(json!({"n": {"$gt": 2}}))).unwrap(), 1);
    assert_eq!(c.estimated_document_count(), 2);
}

#[test]
fn test_distinct_unwinds_arrays_and_sorts() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_many(vec![
        doc(json!({"_id": 1, "tags": ["b", "a"]})),
        doc(json!({"_id": 2, "tags": "c"})),
        doc(json!({"_id": 3, "tags": ["a"]})),
        doc(json!({"_id": 4})),
    ])
    .unwrap();
    assert_eq!(
        c.distinct("tags", None).unwrap(),
        vec![val(json!("a")), val(json!("b")), val(json!("c"))]
    );
    assert_eq!(
        c.distinct("tags", Some(&val(json!({"_id": {"$gte": 2}})))).unwrap(),
        vec![val(json!("a")), val(json!("c"))]
    );
}

// ========================================
// Cursor
// ========================================

#[test]
fn test_cursor_sort_limit_skip() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_many(vec![
        doc(json!({"_id": 1, "n": 3})),
        doc(json!({"_id": 2, "n": 1})),
        doc(json!({"_id": 3, "n": 2})),
    ])
    .unwrap();
    let out = c
        .find(&val(json!({})))
        .unwrap()
        .sort(&val(json!({"n": 1})))
        .unwrap()
        .skip(1)
        .limit(1)
        .to_array();
    assert_eq!(out, vec![doc(json!({"_id": 3, "n": 2}))]);
}

#[test]
fn test_cursor_hint_accepts_known_indexes() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1, "k": 1}))).unwrap();
    c.create_index(&val(json!({"k": 1})), None).unwrap();
    // By name and by key pattern.
    assert!(c.find(&val(json!({}))).unwrap().hint(&val(json!("k_1"))).is_ok());
    assert!(c.find(&val(json!({}))).unwrap().hint(&val(json!({"k": 1}))).is_ok());
}

#[test]
fn test_cursor_bad_hint_is_planner_error() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1}))).unwrap();
    let result = c.find(&val(json!({}))).unwrap().hint(&val(json!("nope_1")));
    assert_err_contains(result, "planner returned error: bad hint");
}

// ========================================
// Index catalog
// ========================================

#[test]
fn test_create_index_names_and_listing() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1}))).unwrap();
    let name = c.create_index(&val(json!({"a": 1, "b": -1})), None).unwrap();
    assert_eq!(name, "a_1_b_-1");
    let listed = c.indexes();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("name"), Some(&val(json!("_id_"))));
    assert_eq!(listed[1].get("key"), Some(&val(json!({"a": 1, "b": -1}))));
}

#[test]
fn test_unique_index_enforced_on_insert() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.create_index(&val(json!({"email": 1})), Some(&val(json!({"unique": true})))).unwrap();
    c.insert_one(doc(json!({"_id": 1, "email": "a@x"}))).unwrap();
    assert_code(c.insert_one(doc(json!({"_id": 2, "email": "a@x"}))), 11000);
    // Sparse unique ignores documents without the key.
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.create_index(
        &val(json!({"email": 1})),
        Some(&val(json!({"unique": true, "sparse": true}))),
    )
    .unwrap();
    c.insert_one(doc(json!({"_id": 1}))).unwrap();
    c.insert_one(doc(json!({"_id": 2}))).unwrap();
}

#[test]
fn test_create_unique_index_checks_existing_data() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_many(vec![
        doc(json!({"_id": 1, "k": 1})),
        doc(json!({"_id": 2, "k": 1})),
    ])
    .unwrap();
    assert_code(
        c.create_index(&val(json!({"k": 1})), Some(&val(json!({"unique": true})))),
        11000,
    );
}

#[test]
fn test_hashed_index_validation() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    let result = c.create_index(
        &val(json!({"k": "hashed"})),
        Some(&val(json!({"unique": true}))),
    );
    assert_code(result.clone(), 67);
    assert_err_contains(result, "hashed");
    let result = c.create_index(&val(json!({"a": "hashed", "b": "hashed"})), None);
    assert_err_contains(result, "one index field");
}

#[test]
fn test_wildcard_index_validation() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    assert_err_contains(
        c.create_index(&val(json!({"$**": 1})), Some(&val(json!({"unique": true})))),
        "wildcard",
    );
    assert_err_contains(
        c.create_index(&val(json!({"$**": 1, "other": 1})), None),
        "compound",
    );
    assert_err_contains(
        c.create_index(
            &val(json!({"a": 1})),
            Some(&val(json!({"wildcardProjection": {"b": 1}}))),
        ),
        "wildcardProjection",
    );
    assert_err_contains(
        c.create_index(
            &val(json!({"$**": 1})),
            Some(&val(json!({"wildcardProjection": {"a": 1, "b": 0}}))),
        ),
        "mix",
    );
    // A clean wildcard index with a projection is fine.
    c.create_index(
        &val(json!({"$**": 1})),
        Some(&val(json!({"wildcardProjection": {"a": 1, "b": 1}}))),
    )
    .unwrap();
}

#[test]
fn test_hidden_id_index_rejected() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    let result = c.create_index(&val(json!({"_id": 1})), Some(&val(json!({"hidden": true}))));
    assert_err_contains(result, "hide");
}

#[test]
fn test_ttl_validation() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    assert_err_contains(
        c.create_index(
            &val(json!({"created": 1})),
            Some(&val(json!({"expireAfterSeconds": "soon"}))),
        ),
        "expireAfterSeconds",
    );
    c.create_index(
        &val(json!({"created": 1})),
        Some(&val(json!({"expireAfterSeconds": 3600}))),
    )
    .unwrap();
}

#[test]
fn test_collation_requires_locale() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    let result = c.create_index(
        &val(json!({"name": 1})),
        Some(&val(json!({"collation": {"strength": 2}}))),
    );
    assert_err_contains(result, "locale");
}

#[test]
fn test_text_index_options() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    assert_err_contains(
        c.create_index(
            &val(json!({"body": "text"})),
            Some(&val(json!({"collation": {"locale": "en"}}))),
        ),
        "collation",
    );
    assert_err_contains(
        c.create_index(
            &val(json!({"body": "text"})),
            Some(&val(json!({"weights": {"body": 0}}))),
        ),
        "99999",
    );
    assert_err_contains(
        c.create_index(
            &val(json!({"plain": 1})),
            Some(&val(json!({"default_language": "en"}))),
        ),
        "default_language",
    );
    let name = c
        .create_index(
            &val(json!({"body": "text"})),
            Some(&val(json!({"weights": {"body": 10}, "default_language": "english"}))),
        )
        .unwrap();
    assert_eq!(name, "body_text");
}

#[test]
fn test_sparse_and_partial_do_not_mix() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    let result = c.create_index(
        &val(json!({"k": 1})),
        Some(&val(json!({
            "sparse": true,
            "partialFilterExpression": {"k": {"$exists": true}}
        }))),
    );
    assert_err_contains(result, "sparse");
}

#[test]
fn test_drop_index() {
    let mut db = Database::new();
    let mut c = db.collection("c");
    c.insert_one(doc(json!({"_id": 1}))).unwrap();
    c.create_index(&val(json!({"k": 1})), None).unwrap();
    c.drop_index("k_1").unwrap();
    assert_eq!(c.indexes().len(), 1);
    assert_err_contains(c.drop_index("k_1"), "index not found");
    assert_err_contains(c.drop_index("_id_"), "_id");
}

// ========================================
// Admin commands
// ========================================

#[test]
fn test_list_collections() {
    let mut db = Database::new();
    db.collection("alpha").insert_one(doc(json!({"_id": 1}))).unwrap();
    db.collection("beta").insert_one(doc(json!({"_id": 1}))).unwrap();
    let all = db.list_collections(None, true).unwrap();
    let names: Vec<&str> = all.iter().map(|d| d.get("name").unwrap().as_str().unwrap()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    let filtered = db
        .list_collections(Some(&val(json!({"name": "beta"}))), false)
        .unwrap();
    assert_eq!(filtered.len(), 1);
}

#[test]
fn test_stats() {
    let mut db = Database::new();
    db.collection("c").insert_many(vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))]).unwrap();
    let db_stats = db.stats();
    assert_eq!(db_stats.get("collections"), Some(&Value::Int(1)));
    assert_eq!(db_stats.get("objects"), Some(&Value::Int(2)));
    let coll_stats = db.collection("c").stats();
    assert_eq!(coll_stats.get("count"), Some(&Value::Int(2)));
    assert_eq!(coll_stats.get("nindexes"), Some(&Value::Int(1)));
}

#[test]
fn test_rename_collection() {
    let mut db = Database::new();
    db.collection("old").insert_one(doc(json!({"_id": 1}))).unwrap();
    db.rename_collection("old", "new", false).unwrap();
    assert_eq!(db.collection("new").estimated_document_count(), 1);
    assert_eq!(db.collection("old").estimated_document_count(), 0);
}

#[test]
fn test_rename_to_itself_errors() {
    let mut db = Database::new();
    db.collection("c").insert_one(doc(json!({"_id": 1}))).unwrap();
    assert_err_contains(
        db.rename_collection("c", "c", false),
        "cannot rename collection to itself",
    );
}

#[test]
fn test_rename_missing_source_is_26() {
    let mut db = Database::new();
    assert_code(db.rename_collection("ghost", "new", false), 26);
}

#[test]
fn test_rename_existing_target_is_48_without_drop_target() {
    let mut db = Database::new();
    db.collection("a").insert_one(doc(json!({"_id": 1}))).unwrap();
    db.collection("b").insert_one(doc(json!({"_id": 2}))).unwrap();
    assert_code(db.rename_collection("a", "b", false), 48);
    // dropTarget replaces the target wholesale.
    db.rename_collection("a", "b", true).unwrap();
    assert_eq!(
        db.collection("b").find_one(&val(json!({}))).unwrap().unwrap(),
        doc(json!({"_id": 1}))
    );
}

#[test]
fn test_invalid_collection_names() {
    let mut db = Database::new();
    assert_err_contains(db.collection("").insert_one(doc(json!({"_id": 1}))), "empty");
    assert_err_contains(db.collection("a$b").insert_one(doc(json!({"_id": 1}))), "$");
    assert_err_contains(db.collection(".hidden").insert_one(doc(json!({"_id": 1}))), "start");
}

#[test]
fn test_drop_collection() {
    let mut db = Database::new();
    db.collection("c").insert_one(doc(json!({"_id": 1}))).unwrap();
    assert!(db.collection("c").drop());
    assert!(!db.collection("c").drop());
    assert_eq!(db.collection("c").estimated_document_count(), 0);
}
