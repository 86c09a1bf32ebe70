use nutmeg::{Database, Document, Error, Value, from_json};
use serde_json::json;

fn doc(v: serde_json::Value) -> Document {
    match from_json(&v) {
        Value::Object(d) => d,
        other => panic!("expected an object, got {:?}", other),
    }
}

fn seed(db: &mut Database, coll: &str, docs: serde_json::Value) {
    let mut collection = db.collection(coll);
    for item in docs.as_array().expect("seed docs must be an array") {
        collection.insert_one(doc(item.clone())).expect("seed insert");
    }
}

fn run_on(db: &mut Database, coll: &str, pipeline: serde_json::Value) -> Result<Vec<Document>, Error> {
    let stages = match from_json(&pipeline) {
        Value::Array(stages) => stages,
        other => panic!("pipeline must be an array, got {:?}", other),
    };
    Ok(db.collection(coll).aggregate(&stages)?.to_array())
}

fn run(docs: serde_json::Value, pipeline: serde_json::Value) -> Result<Vec<Document>, Error> {
    let mut db = Database::new();
    seed(&mut db, "items", docs);
    run_on(&mut db, "items", pipeline)
}

fn run_ok(docs: serde_json::Value, pipeline: serde_json::Value) -> Vec<Document> {
    run(docs, pipeline.clone()).unwrap_or_else(|e| panic!("{:?} failed: {}", pipeline, e))
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

// ========================================
// Streaming stages
// ========================================

#[test]
fn test_match_filters_and_preserves_order() {
    let out = run_ok(
        json!([
            {"_id": 1, "x": 5},
            {"_id": 2, "x": 15},
            {"_id": 3, "x": 25}
        ]),
        json!([{"$match": {"x": {"$gt": 10}}}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": 2, "x": 15})), doc(json!({"_id": 3, "x": 25}))]);
}

#[test]
fn test_project_stage() {
    let out = run_ok(
        json!([{"_id": 1, "a": 1, "b": 2}]),
        json!([{"$project": {"_id": 0, "a": 1, "sum": {"$add": ["$a", "$b"]}}}]),
    );
    assert_eq!(out, vec![doc(json!({"a": 1, "sum": 3}))]);
}

#[test]
fn test_add_fields_and_unset() {
    let out = run_ok(
        json!([{"_id": 1, "a": 2, "junk": true}]),
        json!([
            {"$addFields": {"b": {"$multiply": ["$a", 3]}}},
            {"$unset": "junk"}
        ]),
    );
    assert_eq!(out, vec![doc(json!({"_id": 1, "a": 2, "b": 6}))]);
}

#[test]
fn test_set_is_an_alias_for_add_fields() {
    let out = run_ok(
        json!([{"_id": 1}]),
        json!([{"$set": {"tagged": true}}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": 1, "tagged": true}))]);
}

#[test]
fn test_replace_root() {
    let out = run_ok(
        json!([{"_id": 1, "inner": {"a": 1}}]),
        json!([{"$replaceRoot": {"newRoot": "$inner"}}]),
    );
    assert_eq!(out, vec![doc(json!({"a": 1}))]);
}

#[test]
fn test_replace_root_requires_an_object() {
    assert_err_contains(
        run(json!([{"_id": 1, "inner": 5}]), json!([{"$replaceRoot": {"newRoot": "$inner"}}])),
        "newRoot",
    );
}

#[test]
fn test_replace_with() {
    let out = run_ok(
        json!([{"_id": 1, "a": 2}]),
        json!([{"$replaceWith": {"doubled": {"$multiply": ["$a", 2]}}}]),
    );
    assert_eq!(out, vec![doc(json!({"doubled": 4}))]);
}

#[test]
fn test_sort_is_stable_and_missing_ranks_as_null() {
    let out = run_ok(
        json!([
            {"_id": "a", "k": 2},
            {"_id": "b", "k": 1},
            {"_id": "c", "k": 2},
            {"_id": "d"}
        ]),
        json!([{"$sort": {"k": 1}}]),
    );
    let ids: Vec<&Value> = out.iter().map(|d| d.get("_id").unwrap()).collect();
    // The missing key sorts as null (first); ties keep input order.
    assert_eq!(
        ids,
        vec![
            &Value::String("d".into()),
            &Value::String("b".into()),
            &Value::String("a".into()),
            &Value::String("c".into())
        ]
    );
}

#[test]
fn test_compound_sort() {
    let out = run_ok(
        json!([
            {"_id": 1, "a": 1, "b": 2},
            {"_id": 2, "a": 1, "b": 9},
            {"_id": 3, "a": 0, "b": 5}
        ]),
        json!([{"$sort": {"a": 1, "b": -1}}]),
    );
    let ids: Vec<&Value> = out.iter().map(|d| d.get("_id").unwrap()).collect();
    assert_eq!(ids, vec![&Value::Int(3), &Value::Int(2), &Value::Int(1)]);
}

#[test]
fn test_limit_and_skip() {
    let docs = json!([{"_id": 1}, {"_id": 2}, {"_id": 3}, {"_id": 4}]);
    let out = run_ok(docs.clone(), json!([{"$skip": 1}, {"$limit": 2}]));
    assert_eq!(out, vec![doc(json!({"_id": 2})), doc(json!({"_id": 3}))]);
    assert_err_contains(
        run(docs, json!([{"$limit": -1}])),
        "non-negative",
    );
}

#[test]
fn test_count_stage() {
    let out = run_ok(
        json!([{"_id": 1}, {"_id": 2}, {"_id": 3}]),
        json!([{"$count": "total"}]),
    );
    assert_eq!(out, vec![doc(json!({"total": 3}))]);
}

// ========================================
// $unwind
// ========================================

#[test]
fn test_unwind_basic() {
    let out = run_ok(
        json!([{"_id": 1, "tags": ["a", "b"]}]),
        json!([{"$unwind": "$tags"}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 1, "tags": "a"})),
            doc(json!({"_id": 1, "tags": "b"}))
        ]
    );
}

#[test]
fn test_unwind_drops_empty_and_missing_by_default() {
    let out = run_ok(
        json!([
            {"_id": 1, "tags": []},
            {"_id": 2},
            {"_id": 3, "tags": null},
            {"_id": 4, "tags": ["x"]}
        ]),
        json!([{"$unwind": "$tags"}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": 4, "tags": "x"}))]);
}

#[test]
fn test_unwind_preserve_null_and_empty() {
    let out = run_ok(
        json!([
            {"_id": 1, "tags": []},
            {"_id": 2},
            {"_id": 3, "tags": null}
        ]),
        json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 1, "tags": []})),
            doc(json!({"_id": 2})),
            doc(json!({"_id": 3, "tags": null}))
        ]
    );
}

#[test]
fn test_unwind_include_array_index() {
    let out = run_ok(
        json!([{"_id": 1, "tags": ["a", "b"]}, {"_id": 2, "tags": "solo"}]),
        json!([{"$unwind": {"path": "$tags", "includeArrayIndex": "i"}}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 1, "tags": "a", "i": 0})),
            doc(json!({"_id": 1, "tags": "b", "i": 1})),
            // A bare value unwinds as a singleton, with a null index.
            doc(json!({"_id": 2, "tags": "solo", "i": null}))
        ]
    );
}

// ========================================
// $group and friends
// ========================================

#[test]
fn test_group_one_document_per_distinct_id() {
    let out = run_ok(
        json!([
            {"_id": 1, "k": "a", "v": 1},
            {"_id": 2, "k": "b", "v": 2},
            {"_id": 3, "k": "a", "v": 3}
        ]),
        json!([{"$group": {"_id": "$k", "total": {"$sum": "$v"}, "n": {"$count": {}}}}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": "a", "total": 4, "n": 2})),
            doc(json!({"_id": "b", "total": 2, "n": 1}))
        ]
    );
}

#[test]
fn test_group_id_may_be_object_or_null() {
    let out = run_ok(
        json!([
            {"_id": 1, "a": 1, "b": 2},
            {"_id": 2, "a": 1, "b": 2},
            {"_id": 3}
        ]),
        json!([{"$group": {"_id": {"x": "$a", "y": "$b"}, "n": {"$sum": 1}}}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": {"x": 1, "y": 2}, "n": 2})),
            doc(json!({"_id": {}, "n": 1}))
        ]
    );
}

#[test]
fn test_group_missing_and_null_ids_collapse() {
    let out = run_ok(
        json!([{"_id": 1}, {"_id": 2, "k": null}]),
        json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": null, "n": 2}))]);
}

#[test]
fn test_group_accumulators() {
    let out = run_ok(
        json!([
            {"_id": 1, "v": 4, "w": "x"},
            {"_id": 2, "v": 2, "w": "y"},
            {"_id": 3, "v": 2, "w": "x"}
        ]),
        json!([{"$group": {
            "_id": null,
            "lo": {"$min": "$v"},
            "hi": {"$max": "$v"},
            "first": {"$first": "$v"},
            "last": {"$last": "$v"},
            "all": {"$push": "$w"},
            "distinct": {"$addToSet": "$w"},
            "mean": {"$avg": "$v"}
        }}]),
    );
    assert_eq!(
        out,
        vec![doc(json!({
            "_id": null,
            "lo": 2,
            "hi": 4,
            "first": 4,
            "last": 2,
            "all": ["x", "y", "x"],
            "distinct": ["x", "y"],
            "mean": 8.0 / 3.0
        }))]
    );
}

#[test]
fn test_group_avg_without_numbers_is_null() {
    let out = run_ok(
        json!([{"_id": 1, "v": "nope"}]),
        json!([{"$group": {"_id": null, "mean": {"$avg": "$v"}}}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": null, "mean": null}))]);
}

#[test]
fn test_group_std_dev() {
    let out = run_ok(
        json!([{"_id": 1, "v": 2}, {"_id": 2, "v": 4}]),
        json!([{"$group": {
            "_id": null,
            "pop": {"$stdDevPop": "$v"},
            "samp": {"$stdDevSamp": "$v"}
        }}]),
    );
    let result = &out[0];
    assert_eq!(result.get("pop").unwrap(), &Value::Double(1.0));
    assert!((result.get("samp").unwrap().as_f64().unwrap() - 2f64.sqrt()).abs() < 1e-12);
}

#[test]
fn test_group_std_dev_samp_of_one_is_null() {
    let out = run_ok(
        json!([{"_id": 1, "v": 2}]),
        json!([{"$group": {"_id": null, "samp": {"$stdDevSamp": "$v"}}}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": null, "samp": null}))]);
}

#[test]
fn test_group_merge_objects_accumulator() {
    let out = run_ok(
        json!([
            {"_id": 1, "cfg": {"a": 1, "b": 1}},
            {"_id": 2, "cfg": {"b": 2}}
        ]),
        json!([{"$group": {"_id": null, "merged": {"$mergeObjects": "$cfg"}}}]),
    );
    assert_eq!(out, vec![doc(json!({"_id": null, "merged": {"a": 1, "b": 2}}))]);
}

#[test]
fn test_sort_by_count() {
    let out = run_ok(
        json!([
            {"_id": 1, "k": "a"},
            {"_id": 2, "k": "b"},
            {"_id": 3, "k": "a"},
            {"_id": 4, "k": "a"}
        ]),
        json!([{"$sortByCount": "$k"}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": "a", "count": 3})),
            doc(json!({"_id": "b", "count": 1}))
        ]
    );
}

// ========================================
// $sample
// ========================================

#[test]
fn test_sample_without_replacement() {
    let docs = json!([{"_id": 1}, {"_id": 2}, {"_id": 3}, {"_id": 4}, {"_id": 5}]);
    let out = run_ok(docs, json!([{"$sample": {"size": 3}}]));
    assert_eq!(out.len(), 3);
    let mut ids: Vec<i64> = out.iter().map(|d| d.get("_id").unwrap().as_i64().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3, "sampling must not repeat documents");
}

#[test]
fn test_sample_larger_than_input_returns_all() {
    let out = run_ok(json!([{"_id": 1}, {"_id": 2}]), json!([{"$sample": {"size": 10}}]));
    assert_eq!(out.len(), 2);
}

#[test]
fn test_sample_zero_returns_empty() {
    let out = run_ok(json!([{"_id": 1}]), json!([{"$sample": {"size": 0}}]));
    assert!(out.is_empty());
}

#[test]
fn test_sample_negative_errors() {
    assert_err_contains(
        run(json!([{"_id": 1}]), json!([{"$sample": {"size": -2}}])),
        "positive integer",
    );
}

// ========================================
// $bucket / $bucketAuto
// ========================================

#[test]
fn test_bucket_scores() {
    let out = run_ok(
        json!([
            {"_id": 1, "score": 15}, {"_id": 2, "score": 25}, {"_id": 3, "score": 35},
            {"_id": 4, "score": 45}, {"_id": 5, "score": 55}, {"_id": 6, "score": 65},
            {"_id": 7, "score": 75}, {"_id": 8, "score": 85}, {"_id": 9, "score": 95}
        ]),
        json!([{"$bucket": {
            "groupBy": "$score",
            "boundaries": [0, 30, 60, 90, 100],
            "default": "other",
            "output": {"count": {"$sum": 1}}
        }}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 0, "count": 2})),
            doc(json!({"_id": 30, "count": 3})),
            doc(json!({"_id": 60, "count": 3})),
            doc(json!({"_id": 90, "count": 1}))
        ]
    );
}

#[test]
fn test_bucket_default_collects_out_of_range() {
    let out = run_ok(
        json!([{"_id": 1, "score": -5}, {"_id": 2, "score": 10}]),
        json!([{"$bucket": {
            "groupBy": "$score",
            "boundaries": [0, 100],
            "default": "other"
        }}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 0, "count": 1})),
            doc(json!({"_id": "other", "count": 1}))
        ]
    );
}

#[test]
fn test_bucket_without_default_errors_on_out_of_range() {
    assert_err_contains(
        run(
            json!([{"_id": 1, "score": -5}]),
            json!([{"$bucket": {"groupBy": "$score", "boundaries": [0, 100]}}]),
        ),
        "$bucket",
    );
}

#[test]
fn test_bucket_boundaries_must_increase() {
    assert_err_contains(
        run(
            json!([{"_id": 1}]),
            json!([{"$bucket": {"groupBy": "$x", "boundaries": [10, 10]}}]),
        ),
        "increasing",
    );
}

#[test]
fn test_bucket_auto_splits_evenly() {
    let out = run_ok(
        json!([
            {"_id": 1, "v": 1}, {"_id": 2, "v": 2}, {"_id": 3, "v": 3},
            {"_id": 4, "v": 4}, {"_id": 5, "v": 5}, {"_id": 6, "v": 6},
            {"_id": 7, "v": 7}, {"_id": 8, "v": 8}, {"_id": 9, "v": 9}
        ]),
        json!([{"$bucketAuto": {"groupBy": "$v", "buckets": 3}}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": {"min": 1, "max": 4}, "count": 3})),
            doc(json!({"_id": {"min": 4, "max": 7}, "count": 3})),
            doc(json!({"_id": {"min": 7, "max": 9}, "count": 3}))
        ]
    );
}

// ========================================
// $facet
// ========================================

#[test]
fn test_facet_runs_sub_pipelines_over_same_input() {
    let out = run_ok(
        json!([
            {"_id": 1, "v": 1}, {"_id": 2, "v": 2}, {"_id": 3, "v": 3}
        ]),
        json!([{"$facet": {
            "big": [{"$match": {"v": {"$gte": 2}}}, {"$count": "n"}],
            "total": [{"$group": {"_id": null, "sum": {"$sum": "$v"}}}]
        }}]),
    );
    assert_eq!(
        out,
        vec![doc(json!({
            "big": [{"n": 2}],
            "total": [{"_id": null, "sum": 6}]
        }))]
    );
}

#[test]
fn test_facet_rejects_nested_facet_and_writers() {
    assert_err_contains(
        run(json!([]), json!([{"$facet": {"inner": [{"$facet": {"x": []}}]}}])),
        "$facet",
    );
    assert_err_contains(
        run(json!([]), json!([{"$facet": {"inner": [{"$out": "t"}]}}])),
        "$facet",
    );
}

// ========================================
// $lookup
// ========================================

#[test]
fn test_lookup_equi_join() {
    let mut db = Database::new();
    seed(&mut db, "orders", json!([
        {"_id": 1, "sku": "apple"},
        {"_id": 2, "sku": "pear"}
    ]));
    seed(&mut db, "stock", json!([
        {"_id": 10, "sku": "apple", "qty": 5},
        {"_id": 11, "sku": "apple", "qty": 2},
        {"_id": 12, "sku": "plum", "qty": 9}
    ]));
    let out = run_on(&mut db, "orders", json!([
        {"$lookup": {"from": "stock", "localField": "sku", "foreignField": "sku", "as": "stock"}}
    ]))
    .unwrap();
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 1, "sku": "apple", "stock": [
                {"_id": 10, "sku": "apple", "qty": 5},
                {"_id": 11, "sku": "apple", "qty": 2}
            ]})),
            doc(json!({"_id": 2, "sku": "pear", "stock": []}))
        ]
    );
}

#[test]
fn test_lookup_is_array_aware_on_both_sides() {
    let mut db = Database::new();
    seed(&mut db, "left", json!([{"_id": 1, "tags": ["a", "b"]}]));
    seed(&mut db, "right", json!([
        {"_id": 10, "tag": "b"},
        {"_id": 11, "tag": "z"}
    ]));
    let out = run_on(&mut db, "left", json!([
        {"$lookup": {"from": "right", "localField": "tags", "foreignField": "tag", "as": "hits"}},
        {"$project": {"_id": 1, "n": {"$size": "$hits"}}}
    ]))
    .unwrap();
    assert_eq!(out, vec![doc(json!({"_id": 1, "n": 1}))]);
}

#[test]
fn test_lookup_pipeline_with_join_condition() {
    let mut db = Database::new();
    seed(&mut db, "orders", json!([
        {"_id": 1, "item": "almonds", "price": 12, "quantity": 2}
    ]));
    seed(&mut db, "inventory", json!([
        {"_id": 1, "sku": "almonds", "description": "product 1", "instock": 120},
        {"_id": 2, "sku": "bread", "description": "product 2", "instock": 80},
        {"_id": 3, "sku": "cashews", "description": "product 3", "instock": 60}
    ]));
    let out = run_on(&mut db, "orders", json!([
        {"$lookup": {
            "from": "inventory",
            "let": {"orderItem": "$item"},
            "pipeline": [
                {"$match": {"$expr": {"$eq": ["$sku", "$$orderItem"]}}}
            ],
            "as": "fromItems"
        }}
    ]))
    .unwrap();
    assert_eq!(out.len(), 1);
    let from_items = out[0].get("fromItems").unwrap().as_array().unwrap();
    assert_eq!(from_items.len(), 1);
    assert_eq!(
        from_items[0],
        from_json(&json!({"_id": 1, "sku": "almonds", "description": "product 1", "instock": 120}))
    );
}

#[test]
fn test_lookup_let_supports_dotted_variable_paths() {
    let mut db = Database::new();
    seed(&mut db, "orders", json!([
        {"_id": 1, "customer": {"tier": "gold"}}
    ]));
    seed(&mut db, "perks", json!([
        {"_id": 1, "tier": "gold", "perk": "lounge"},
        {"_id": 2, "tier": "basic", "perk": "none"}
    ]));
    let out = run_on(&mut db, "orders", json!([
        {"$lookup": {
            "from": "perks",
            "let": {"customer": "$customer"},
            "pipeline": [{"$match": {"$expr": {"$eq": ["$tier", "$$customer.tier"]}}}],
            "as": "perks"
        }},
        {"$project": {"_id": 1, "n": {"$size": "$perks"}}}
    ]))
    .unwrap();
    assert_eq!(out, vec![doc(json!({"_id": 1, "n": 1}))]);
}

// ========================================
// $unionWith
// ========================================

#[test]
fn test_union_with_appends_other_collection() {
    let mut db = Database::new();
    seed(&mut db, "a", json!([{"_id": 1, "src": "a"}]));
    seed(&mut db, "b", json!([{"_id": 2, "src": "b"}, {"_id": 3, "src": "b"}]));
    let mut out = run_on(&mut db, "a", json!([{"$unionWith": "b"}])).unwrap();
    out.sort_by(|x, y| {
        x.get("_id").unwrap().compare(y.get("_id").unwrap())
    });
    assert_eq!(out.len(), 3);
}

#[test]
fn test_union_with_sub_pipeline() {
    let mut db = Database::new();
    seed(&mut db, "a", json!([{"_id": 1, "v": 1}]));
    seed(&mut db, "b", json!([{"_id": 2, "v": 10}, {"_id": 3, "v": 99}]));
    let out = run_on(&mut db, "a", json!([
        {"$unionWith": {"coll": "b", "pipeline": [{"$match": {"v": {"$lt": 50}}}]}}
    ]))
    .unwrap();
    assert_eq!(out.len(), 2);
}

// ========================================
// $setWindowFields
// ========================================

#[test]
fn test_window_running_total() {
    let out = run_ok(
        json!([
            {"_id": 1, "d": {"$date": 1672531200000i64}, "v": 10},
            {"_id": 2, "d": {"$date": 1672617600000i64}, "v": 20},
            {"_id": 3, "d": {"$date": 1672704000000i64}, "v": 15},
            {"_id": 4, "d": {"$date": 1672790400000i64}, "v": 25}
        ]),
        json!([
            {"$sort": {"d": 1}},
            {"$setWindowFields": {
                "sortBy": {"d": 1},
                "output": {"runningTotal": {"$sum": "$v", "window": {"documents": ["unbounded", "current"]}}}
            }}
        ]),
    );
    let totals: Vec<i64> = out
        .iter()
        .map(|d| d.get("runningTotal").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(totals, vec![10, 30, 45, 70]);
}

#[test]
fn test_window_partitions_independently() {
    let out = run_ok(
        json!([
            {"_id": 1, "g": "a", "v": 1},
            {"_id": 2, "g": "b", "v": 10},
            {"_id": 3, "g": "a", "v": 2},
            {"_id": 4, "g": "b", "v": 20}
        ]),
        json!([{"$setWindowFields": {
            "partitionBy": "$g",
            "sortBy": {"v": 1},
            "output": {"total": {"$sum": "$v"}}
        }}]),
    );
    for item in &out {
        let g = item.get("g").unwrap().as_str().unwrap();
        let total = item.get("total").unwrap().as_i64().unwrap();
        assert_eq!(total, if g == "a" { 3 } else { 30 });
    }
}

#[test]
fn test_window_rank_functions() {
    let out = run_ok(
        json!([
            {"_id": 1, "score": 10},
            {"_id": 2, "score": 20},
            {"_id": 3, "score": 20},
            {"_id": 4, "score": 30}
        ]),
        json!([{"$setWindowFields": {
            "sortBy": {"score": 1},
            "output": {
                "rank": {"$rank": {}},
                "dense": {"$denseRank": {}},
                "row": {"$rowNumber": {}}
            }
        }}]),
    );
    let triples: Vec<(i64, i64, i64)> = out
        .iter()
        .map(|d| {
            (
                d.get("rank").unwrap().as_i64().unwrap(),
                d.get("dense").unwrap().as_i64().unwrap(),
                d.get("row").unwrap().as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(triples, vec![(1, 1, 1), (2, 2, 2), (2, 2, 3), (4, 3, 4)]);
}

#[test]
fn test_window_shift() {
    let out = run_ok(
        json!([
            {"_id": 1, "t": 1, "v": "a"},
            {"_id": 2, "t": 2, "v": "b"},
            {"_id": 3, "t": 3, "v": "c"}
        ]),
        json!([{"$setWindowFields": {
            "sortBy": {"t": 1},
            "output": {"prev": {"$shift": {"output": "$v", "by": -1, "default": "none"}}}
        }}]),
    );
    let prevs: Vec<&Value> = out.iter().map(|d| d.get("prev").unwrap()).collect();
    assert_eq!(
        prevs,
        vec![
            &Value::String("none".into()),
            &Value::String("a".into()),
            &Value::String("b".into())
        ]
    );
}

#[test]
fn test_window_derivative_with_unit() {
    // 100 units of climb over one hour, sampled every 30 minutes.
    let out = run_ok(
        json!([
            {"_id": 1, "t": {"$date": 0}, "v": 0},
            {"_id": 2, "t": {"$date": 1800000}, "v": 50},
            {"_id": 3, "t": {"$date": 3600000}, "v": 100}
        ]),
        json!([{"$setWindowFields": {
            "sortBy": {"t": 1},
            "output": {"rate": {
                "$derivative": {"input": "$v", "unit": "hour"},
                "window": {"documents": [-1, 0]}
            }}
        }}]),
    );
    let rates: Vec<&Value> = out.iter().map(|d| d.get("rate").unwrap()).collect();
    assert_eq!(rates[0], &Value::Null);
    assert_eq!(rates[1], &Value::Double(100.0));
    assert_eq!(rates[2], &Value::Double(100.0));
}

#[test]
fn test_window_range_bounds() {
    let out = run_ok(
        json!([
            {"_id": 1, "x": 1, "v": 1},
            {"_id": 2, "x": 2, "v": 1},
            {"_id": 3, "x": 10, "v": 1}
        ]),
        json!([{"$setWindowFields": {
            "sortBy": {"x": 1},
            "output": {"near": {"$sum": "$v", "window": {"range": [-1, 1]}}}
        }}]),
    );
    let sums: Vec<i64> = out.iter().map(|d| d.get("near").unwrap().as_i64().unwrap()).collect();
    // x=1 and x=2 see each other; x=10 is alone.
    assert_eq!(sums, vec![2, 2, 1]);
}

#[test]
fn test_window_rank_requires_sort_by() {
    assert_err_contains(
        run(
            json!([{"_id": 1}]),
            json!([{"$setWindowFields": {"output": {"r": {"$rank": {}}}}}]),
        ),
        "sortBy",
    );
}

// ========================================
// $merge / $out
// ========================================

fn target_docs(db: &mut Database) -> Vec<Document> {
    db.collection("target").find(&from_json(&json!({}))).unwrap().to_array()
}

#[test]
fn test_merge_updates_matched_and_inserts_unmatched() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1, "v": 1}]));
    seed(&mut db, "source", json!([
        {"_id": 1, "v": 2, "extra": true},
        {"_id": 2, "v": 9}
    ]));
    let out = run_on(&mut db, "source", json!([{"$merge": "target"}])).unwrap();
    assert!(out.is_empty(), "$merge emits the empty stream");
    assert_eq!(
        target_docs(&mut db),
        vec![
            doc(json!({"_id": 1, "v": 2, "extra": true})),
            doc(json!({"_id": 2, "v": 9}))
        ]
    );
}

#[test]
fn test_merge_when_matched_merge_preserves_unmentioned_fields() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1, "keep": "old", "v": 1}]));
    seed(&mut db, "source", json!([{"_id": 1, "v": 2}]));
    run_on(&mut db, "source", json!([{"$merge": {"into": "target", "whenMatched": "merge"}}]))
        .unwrap();
    assert_eq!(
        target_docs(&mut db),
        vec![doc(json!({"_id": 1, "keep": "old", "v": 2}))]
    );
}

#[test]
fn test_merge_keep_existing_and_discard() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1, "v": 1}]));
    seed(&mut db, "source", json!([{"_id": 1, "v": 2}, {"_id": 2, "v": 3}]));
    run_on(&mut db, "source", json!([{"$merge": {
        "into": "target",
        "whenMatched": "keepExisting",
        "whenNotMatched": "discard"
    }}]))
    .unwrap();
    assert_eq!(target_docs(&mut db), vec![doc(json!({"_id": 1, "v": 1}))]);
}

#[test]
fn test_merge_replace_preserves_existing_id() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1, "k": "match", "old": true}]));
    db.collection("target")
        .create_index(&from_json(&json!({"k": 1})), Some(&from_json(&json!({"unique": true}))))
        .unwrap();
    seed(&mut db, "source", json!([{"_id": 99, "k": "match", "new": true}]));
    run_on(&mut db, "source", json!([{"$merge": {
        "into": "target",
        "on": "k",
        "whenMatched": "replace"
    }}]))
    .unwrap();
    assert_eq!(
        target_docs(&mut db),
        vec![doc(json!({"_id": 1, "k": "match", "new": true}))]
    );
}

#[test]
fn test_merge_fail_modes() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1}]));
    seed(&mut db, "source", json!([{"_id": 1}]));
    let matched = run_on(&mut db, "source", json!([{"$merge": {
        "into": "target", "whenMatched": "fail"
    }}]));
    assert_err_contains(matched, "$merge");

    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1}]));
    seed(&mut db, "source", json!([{"_id": 2}]));
    let unmatched = run_on(&mut db, "source", json!([{"$merge": {
        "into": "target", "whenNotMatched": "fail"
    }}]));
    match unmatched {
        Err(e) => {
            assert!(e.message.contains("$merge"));
            assert!(e.message.contains("match"));
        }
        Ok(v) => panic!("expected failure, got {:?}", v),
    }
    // Nothing was written on failure.
    assert_eq!(target_docs(&mut db), vec![doc(json!({"_id": 1}))]);
}

#[test]
fn test_merge_on_requires_unique_index() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1, "k": 1}]));
    seed(&mut db, "source", json!([{"_id": 2, "k": 1}]));
    let result = run_on(&mut db, "source", json!([{"$merge": {"into": "target", "on": "k"}}]));
    assert_err_contains(result, "unique");
}

#[test]
fn test_merge_when_matched_pipeline_sees_new() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 1, "value": 10, "originalValue": 10}]));
    seed(&mut db, "source", json!([{"_id": 1, "value": 25}]));
    run_on(&mut db, "source", json!([{"$merge": {
        "into": "target",
        "whenMatched": [{"$set": {"value": "$$new.value", "updated": true}}],
        "whenNotMatched": "insert"
    }}]))
    .unwrap();
    assert_eq!(
        target_docs(&mut db),
        vec![doc(json!({"_id": 1, "value": 25, "originalValue": 10, "updated": true}))]
    );
}

#[test]
fn test_out_replaces_collection_atomically() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 9, "stale": true}]));
    seed(&mut db, "source", json!([{"_id": 1, "v": 1}, {"_id": 2, "v": 2}]));
    let out = run_on(&mut db, "source", json!([
        {"$match": {"v": {"$gte": 2}}},
        {"$out": "target"}
    ]))
    .unwrap();
    assert!(out.is_empty(), "$out emits the empty stream");
    assert_eq!(target_docs(&mut db), vec![doc(json!({"_id": 2, "v": 2}))]);
}

#[test]
fn test_out_leaves_target_untouched_on_error() {
    let mut db = Database::new();
    seed(&mut db, "target", json!([{"_id": 9, "stale": true}]));
    seed(&mut db, "source", json!([{"_id": 1, "v": 1}]));
    let result = run_on(&mut db, "source", json!([
        {"$addFields": {"boom": {"$divide": [1, 0]}}},
        {"$out": "target"}
    ]));
    assert!(result.is_err());
    assert_eq!(target_docs(&mut db), vec![doc(json!({"_id": 9, "stale": true}))]);
}

#[test]
fn test_out_must_be_last_stage() {
    assert_err_contains(
        run(json!([]), json!([{"$out": "t"}, {"$limit": 1}])),
        "final stage",
    );
}

#[test]
fn test_unknown_stage_name_errors() {
    assert_err_contains(
        run(json!([]), json!([{"$teleport": {}}])),
        "Unrecognized pipeline stage name",
    );
}

#[test]
fn test_stage_must_have_exactly_one_operator() {
    assert_err_contains(
        run(json!([]), json!([{"$match": {}, "$limit": 1}])),
        "exactly one field",
    );
}

// ========================================
// End-to-end scenarios
// ========================================

#[test]
fn test_scenario_revenue_by_category() {
    let out = run_ok(
        json!([
            {"_id": 1, "name": "Laptop", "category": "Electronics", "price": 1000, "qty": 2},
            {"_id": 2, "name": "Phone", "category": "Electronics", "price": 500, "qty": 5},
            {"_id": 3, "name": "Shirt", "category": "Clothing", "price": 30, "qty": 10},
            {"_id": 4, "name": "Pants", "category": "Clothing", "price": 50, "qty": 8},
            {"_id": 5, "name": "Tablet", "category": "Electronics", "price": 300, "qty": 3}
        ]),
        json!([
            {"$match": {"price": {"$gt": 40}}},
            {"$group": {
                "_id": "$category",
                "totalRevenue": {"$sum": {"$multiply": ["$price", "$qty"]}},
                "avgPrice": {"$avg": "$price"},
                "count": {"$sum": 1}
            }},
            {"$sort": {"totalRevenue": -1}},
            {"$project": {
                "category": "$_id",
                "totalRevenue": 1,
                "avgPrice": {"$round": ["$avgPrice", 2]},
                "count": 1,
                "_id": 0
            }}
        ]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"category": "Electronics", "totalRevenue": 5400, "avgPrice": 600.0, "count": 3})),
            doc(json!({"category": "Clothing", "totalRevenue": 400, "avgPrice": 50.0, "count": 1}))
        ]
    );
}

#[test]
fn test_scenario_grade_switch() {
    let grade = json!({"$switch": {
        "branches": [
            {"case": {"$gte": ["$score", 90]}, "then": "A"},
            {"case": {"$gte": ["$score", 80]}, "then": "B"},
            {"case": {"$gte": ["$score", 70]}, "then": "C"}
        ],
        "default": "F"
    }});
    let out = run_ok(
        json!([{"_id": 1, "score": 85}, {"_id": 2, "score": 50}]),
        json!([{"$project": {"_id": 1, "grade": grade}}]),
    );
    assert_eq!(
        out,
        vec![
            doc(json!({"_id": 1, "grade": "B"})),
            doc(json!({"_id": 2, "grade": "F"}))
        ]
    );
}
