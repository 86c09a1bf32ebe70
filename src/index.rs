//! The index catalog. The engine never maintains physical index
//! structures; it validates specs on creation (code 67), enforces
//! `unique` on writes, answers `hint` lookups, and backs the
//! `$merge.on` unique-key requirement.

use crate::error::{Error, Result};
use crate::matcher;
use crate::value::{Document, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Ascending,
    Descending,
    Hashed,
    Text,
    Wildcard,
}

#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, IndexKey)>,
    pub unique: bool,
    pub sparse: bool,
    pub hidden: bool,
    pub expire_after_seconds: Option<i64>,
    pub partial_filter_expression: Option<Value>,
    pub collation: Option<Document>,
    pub wildcard_projection: Option<Document>,
    pub weights: Option<Document>,
    pub default_language: Option<String>,
    pub text_index_version: Option<i64>,
}

impl IndexSpec {
    /// The default `_id_` index every collection carries.
    pub fn id_index() -> IndexSpec {
        IndexSpec {
            name: "_id_".to_string(),
            keys: vec![("_id".to_string(), IndexKey::Ascending)],
            unique: true,
            sparse: false,
            hidden: false,
            expire_after_seconds: None,
            partial_filter_expression: None,
            collation: None,
            wildcard_projection: None,
            weights: None,
            default_language: None,
            text_index_version: None,
        }
    }

    /// Plain field names of the key pattern, for unique-key lookups.
    pub fn key_fields(&self) -> Vec<String> {
        self.keys.iter().map(|(field, _)| field.clone()).collect()
    }

    /// The key pattern as a document, the shape `indexes()` reports and
    /// `hint` compares against.
    pub fn key_document(&self) -> Document {
        let mut doc = Document::new();
        for (field, key) in &self.keys {
            let value = match key {
                IndexKey::Ascending | IndexKey::Wildcard => Value::Int(1),
                IndexKey::Descending => Value::Int(-1),
                IndexKey::Hashed => Value::String("hashed".to_string()),
                IndexKey::Text => Value::String("text".to_string()),
            };
            doc.insert(field.clone(), value);
        }
        doc
    }

    pub fn describe(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("v".to_string(), Value::Int(2));
        doc.insert("key".to_string(), Value::Object(self.key_document()));
        doc.insert("name".to_string(), Value::String(self.name.clone()));
        if self.unique {
            doc.insert("unique".to_string(), Value::Bool(true));
        }
        if self.sparse {
            doc.insert("sparse".to_string(), Value::Bool(true));
        }
        if self.hidden {
            doc.insert("hidden".to_string(), Value::Bool(true));
        }
        if let Some(ttl) = self.expire_after_seconds {
            doc.insert("expireAfterSeconds".to_string(), Value::from_int(ttl));
        }
        if let Some(filter) = &self.partial_filter_expression {
            doc.insert("partialFilterExpression".to_string(), filter.clone());
        }
        if let Some(collation) = &self.collation {
            doc.insert("collation".to_string(), Value::Object(collation.clone()));
        }
        if let Some(projection) = &self.wildcard_projection {
            doc.insert("wildcardProjection".to_string(), Value::Object(projection.clone()));
        }
        if let Some(weights) = &self.weights {
            doc.insert("weights".to_string(), Value::Object(weights.clone()));
        }
        if let Some(language) = &self.default_language {
            doc.insert("default_language".to_string(), Value::String(language.clone()));
        }
        if let Some(version) = self.text_index_version {
            doc.insert("textIndexVersion".to_string(), Value::from_int(version));
        }
        doc
    }
}

/// Parse and validate a `createIndex` spec: the key pattern plus options.
pub fn parse(keys: &Value, options: Option<&Value>) -> Result<IndexSpec> {
    let Value::Object(key_doc) = keys else {
        return Err(Error::index_spec("index key pattern must be an object"));
    };
    if key_doc.is_empty() {
        return Err(Error::index_spec("index key pattern must have at least one field"));
    }
    let mut parsed_keys = Vec::with_capacity(key_doc.len());
    for (field, direction) in key_doc {
        let key = if field == "$**" || field.ends_with(".$**") {
            IndexKey::Wildcard
        } else {
            match direction {
                Value::String(s) if s == "hashed" => IndexKey::Hashed,
                Value::String(s) if s == "text" => IndexKey::Text,
                v => match v.as_f64() {
                    Some(n) if n > 0.0 => IndexKey::Ascending,
                    Some(n) if n < 0.0 => IndexKey::Descending,
                    _ => {
                        return Err(Error::index_spec(format!(
                            "Values in the index key pattern must be 1, -1, \
                             'hashed' or 'text'; found {} for field '{}'",
                            v.type_name(),
                            field
                        )));
                    }
                },
            }
        };
        parsed_keys.push((field.clone(), key));
    }

    let empty = Document::new();
    let options = match options {
        Some(Value::Object(doc)) => doc,
        Some(_) => return Err(Error::index_spec("index options must be an object")),
        None => &empty,
    };

    let flag = |name: &str| matches!(options.get(name), Some(v) if v.is_truthy());
    let unique = flag("unique");
    let sparse = flag("sparse");
    let hidden = flag("hidden");

    let hashed_count = parsed_keys
        .iter()
        .filter(|(_, k)| *k == IndexKey::Hashed)
        .count();
    if hashed_count > 1 {
        return Err(Error::index_spec(
            "A maximum of one index field is allowed to be hashed",
        ));
    }
    if hashed_count > 0 && unique {
        return Err(Error::index_spec(
            "Currently hashed indexes cannot guarantee uniqueness. Use a regular index.",
        ));
    }

    let has_wildcard = parsed_keys.iter().any(|(_, k)| *k == IndexKey::Wildcard);
    if has_wildcard {
        if unique {
            return Err(Error::index_spec(
                "wildcard indexes do not support the 'unique' option",
            ));
        }
        if parsed_keys.len() > 1 {
            return Err(Error::index_spec("wildcard indexes do not allow compound keys"));
        }
    }

    let wildcard_projection = match options.get("wildcardProjection") {
        None => None,
        Some(Value::Object(projection)) => {
            if !has_wildcard || parsed_keys[0].0 != "$**" {
                return Err(Error::index_spec(
                    "The field 'wildcardProjection' is only allowed when the index key \
                     is {\"$**\": 1}",
                ));
            }
            if projection.is_empty() {
                return Err(Error::index_spec("'wildcardProjection' cannot be empty"));
            }
            let mut saw_include = false;
            let mut saw_exclude = false;
            for (field, v) in projection {
                match v.as_f64() {
                    Some(n) if n == 0.0 => saw_exclude = true,
                    Some(_) => saw_include = true,
                    None => {
                        return Err(Error::index_spec(
                            "'wildcardProjection' values must be numeric",
                        ));
                    }
                }
                if saw_include && saw_exclude && field != "_id" {
                    return Err(Error::index_spec(
                        "Cannot mix inclusion and exclusion in 'wildcardProjection'",
                    ));
                }
            }
            Some(projection.clone())
        }
        Some(_) => return Err(Error::index_spec("'wildcardProjection' must be an object")),
    };

    if hidden && parsed_keys.len() == 1 && parsed_keys[0].0 == "_id" {
        return Err(Error::index_spec("can't hide _id index"));
    }

    let expire_after_seconds = match options.get("expireAfterSeconds") {
        None => None,
        Some(v) => match v.as_i64() {
            Some(ttl) if ttl >= 0 => Some(ttl),
            Some(_) => {
                return Err(Error::index_spec(
                    "expireAfterSeconds must be a non-negative number",
                ));
            }
            None => return Err(Error::index_spec("expireAfterSeconds must be a number")),
        },
    };

    let partial_filter_expression = match options.get("partialFilterExpression") {
        None => None,
        Some(filter @ Value::Object(_)) => {
            // Must at least compile as a predicate.
            matcher::compile(filter)?;
            Some(filter.clone())
        }
        Some(_) => {
            return Err(Error::index_spec("partialFilterExpression must be an object"));
        }
    };
    if sparse && partial_filter_expression.is_some() {
        return Err(Error::index_spec(
            "cannot mix 'partialFilterExpression' and 'sparse' options",
        ));
    }

    let has_text = parsed_keys.iter().any(|(_, k)| *k == IndexKey::Text);
    let collation = match options.get("collation") {
        None => None,
        Some(Value::Object(collation)) => {
            if has_text {
                return Err(Error::index_spec(
                    "Index type 'text' does not support the 'collation' option",
                ));
            }
            match collation.get("locale") {
                Some(Value::String(_)) => {}
                _ => {
                    return Err(Error::index_spec(
                        "'locale' is required in a collation document",
                    ));
                }
            }
            Some(collation.clone())
        }
        Some(_) => return Err(Error::index_spec("'collation' must be an object")),
    };

    let weights = match options.get("weights") {
        None => None,
        Some(Value::Object(weights)) => {
            if !has_text {
                return Err(Error::index_spec(
                    "The 'weights' field is only allowed with a 'text' index",
                ));
            }
            for (field, weight) in weights {
                let valid = weight
                    .as_i64()
                    .is_some_and(|w| (1..=99999).contains(&w));
                if !valid {
                    return Err(Error::index_spec(format!(
                        "text index weights must be an integer between 1 and 99999, \
                         found an invalid weight for '{}'",
                        field
                    )));
                }
            }
            Some(weights.clone())
        }
        Some(_) => return Err(Error::index_spec("'weights' must be an object")),
    };

    let default_language = match options.get("default_language") {
        None => None,
        Some(Value::String(language)) => {
            if !has_text {
                return Err(Error::index_spec(
                    "The 'default_language' field is only allowed with a 'text' index",
                ));
            }
            Some(language.clone())
        }
        Some(_) => return Err(Error::index_spec("'default_language' must be a string")),
    };

    let text_index_version = match options.get("textIndexVersion") {
        None => has_text.then_some(3),
        Some(v) => match v.as_i64() {
            Some(version) => Some(version),
            None => return Err(Error::index_spec("textIndexVersion must be a number")),
        },
    };

    let name = match options.get("name") {
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        Some(_) => return Err(Error::index_spec("index name must be a non-empty string")),
        None => default_name(&parsed_keys),
    };

    Ok(IndexSpec {
        name,
        keys: parsed_keys,
        unique,
        sparse,
        hidden,
        expire_after_seconds,
        partial_filter_expression,
        collation,
        wildcard_projection,
        weights,
        default_language,
        text_index_version,
    })
}

/// `{a: 1, b: -1}` names itself `a_1_b_-1`; hashed and text keys use the
/// kind as the suffix.
fn default_name(keys: &[(String, IndexKey)]) -> String {
    keys.iter()
        .map(|(field, key)| {
            let suffix = match key {
                IndexKey::Ascending | IndexKey::Wildcard => "1",
                IndexKey::Descending => "-1",
                IndexKey::Hashed => "hashed",
                IndexKey::Text => "text",
            };
            format!("{}_{}", field, suffix)
        })
        .collect::<Vec<_>>()
        .join("_")
}
