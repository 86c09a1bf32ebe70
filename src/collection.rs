//! The storage collaborator: an in-memory database of named collections
//! with the client-facing command surface (CRUD, cursors, distinct,
//! index catalog, admin commands). The aggregation engine treats this as
//! its black box for `$lookup`, `$unionWith`, `$merge` and `$out`.

use chrono::Utc;
use indexmap::IndexMap;
use log::debug;
use rand::Rng;

use crate::error::{Error, Result};
use crate::eval::EvalCtx;
use crate::index::{self, IndexSpec};
use crate::matcher;
use crate::path;
use crate::pipeline::{self, SortSpec};
use crate::update;
use crate::value::{Document, Value};

#[derive(Debug)]
struct CollectionData {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl CollectionData {
    fn new() -> CollectionData {
        CollectionData {
            docs: Vec::new(),
            indexes: vec![IndexSpec::id_index()],
        }
    }
}

/// An embedded, in-process database: a set of named collections sharing
/// one id generator.
#[derive(Debug)]
pub struct Database {
    collections: IndexMap<String, CollectionData>,
    id_counter: u64,
}

impl Default for Database {
    fn default() -> Database {
        Database::new()
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_namespace(
            "Invalid namespace specified: collection name cannot be empty",
        ));
    }
    if name.contains('$') {
        return Err(Error::invalid_namespace(format!(
            "Invalid namespace specified: collection name '{}' must not contain '$'",
            name
        )));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(Error::invalid_namespace(format!(
            "Invalid namespace specified: collection name '{}' must not start or end with '.'",
            name
        )));
    }
    Ok(())
}

impl Database {
    pub fn new() -> Database {
        Database {
            collections: IndexMap::new(),
            id_counter: 0,
        }
    }

    /// A handle for per-collection operations. The collection itself is
    /// created lazily on first write.
    pub fn collection(&mut self, name: &str) -> Collection<'_> {
        Collection {
            db: self,
            name: name.to_string(),
        }
    }

    /// `listCollections(filter?, {nameOnly?})`.
    pub fn list_collections(
        &self,
        filter: Option<&Value>,
        name_only: bool,
    ) -> Result<Vec<Document>> {
        let pred = filter.map(matcher::compile).transpose()?;
        let ctx = EvalCtx::new(Utc::now().timestamp_millis());
        let mut out = Vec::new();
        for name in self.collections.keys() {
            let mut info = Document::new();
            info.insert("name".to_string(), Value::String(name.clone()));
            info.insert("type".to_string(), Value::String("collection".to_string()));
            if !name_only {
                info.insert("options".to_string(), Value::Object(Document::new()));
            }
            if let Some(pred) = &pred {
                if !matcher::matches(pred, &Value::Object(info.clone()), &ctx)? {
                    continue;
                }
            }
            out.push(info);
        }
        Ok(out)
    }

    /// Database-level `stats()`.
    pub fn stats(&self) -> Document {
        let objects: usize = self.collections.values().map(|c| c.docs.len()).sum();
        let indexes: usize = self.collections.values().map(|c| c.indexes.len()).sum();
        let mut doc = Document::new();
        doc.insert(
            "collections".to_string(),
            Value::from_int(self.collections.len() as i64),
        );
        doc.insert("objects".to_string(), Value::from_int(objects as i64));
        doc.insert("indexes".to_string(), Value::from_int(indexes as i64));
        doc
    }

    /// Drop a collection; returns whether it existed.
    pub fn drop_collection(&mut self, name: &str) -> bool {
        self.collections.shift_remove(name).is_some()
    }

    /// `renameCollection(old, new, {dropTarget})`.
    pub fn rename_collection(&mut self, from: &str, to: &str, drop_target: bool) -> Result<()> {
        validate_collection_name(to)?;
        if from == to {
            return Err(Error::invalid_namespace("cannot rename collection to itself"));
        }
        if !self.collections.contains_key(from) {
            return Err(Error::namespace_not_found(from));
        }
        if self.collections.contains_key(to) {
            if !drop_target {
                return Err(Error::namespace_exists(to));
            }
            self.collections.shift_remove(to);
        }
        let data = self.collections.shift_remove(from).expect("presence checked");
        self.collections.insert(to.to_string(), data);
        Ok(())
    }

    pub(crate) fn collection_docs(&self, name: &str) -> Vec<Document> {
        self.collections
            .get(name)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_collection_docs(&mut self, name: &str, docs: Vec<Document>) -> Result<()> {
        validate_collection_name(name)?;
        self.collections
            .entry(name.to_string())
            .or_insert_with(CollectionData::new)
            .docs = docs;
        Ok(())
    }

    /// Whether a unique index covers exactly this key set (`$merge.on`).
    pub(crate) fn has_unique_index_on(&self, name: &str, fields: &[String]) -> bool {
        let Some(data) = self.collections.get(name) else {
            return false;
        };
        let mut wanted: Vec<&String> = fields.iter().collect();
        wanted.sort();
        data.indexes.iter().any(|spec| {
            if !spec.unique {
                return false;
            }
            let mut covered = spec.key_fields();
            covered.sort();
            covered.len() == wanted.len()
                && covered.iter().zip(&wanted).all(|(a, b)| a == *b)
        })
    }

    /// A fresh document id: 24 hex characters of timestamp, randomness
    /// and a counter.
    pub(crate) fn generate_id(&mut self) -> Value {
        self.id_counter += 1;
        let seconds = Utc::now().timestamp() as u32;
        let noise: u32 = rand::rng().random();
        Value::String(format!(
            "{:08x}{:08x}{:08x}",
            seconds,
            noise,
            self.id_counter as u32
        ))
    }
}

/// The unique-key tuple of a document under an index, or None when the
/// index does not apply (sparse with all keys missing, or a partial
/// filter that does not match).
fn unique_key(
    doc: &Document,
    spec: &IndexSpec,
    ctx: &EvalCtx,
) -> Result<Option<Vec<Value>>> {
    if let Some(filter) = &spec.partial_filter_expression {
        let pred = matcher::compile(filter)?;
        if !matcher::matches(&pred, &Value::Object(doc.clone()), ctx)? {
            return Ok(None);
        }
    }
    let current = Value::Object(doc.clone());
    let values: Vec<Value> = spec
        .key_fields()
        .iter()
        .map(|field| path::resolve(&current, &path::split(field)))
        .collect();
    if spec.sparse && values.iter().all(|v| v.is_missing()) {
        return Ok(None);
    }
    Ok(Some(
        values
            .into_iter()
            .map(|v| if v.is_missing() { Value::Null } else { v })
            .collect(),
    ))
}

fn render_key(fields: &[String], values: &[Value]) -> String {
    let parts: Vec<String> = fields
        .iter()
        .zip(values)
        .map(|(field, value)| {
            format!("{}: {}", field, serde_json::to_string(&crate::value::to_json(value))
                .unwrap_or_else(|_| "?".to_string()))
        })
        .collect();
    format!("{{ {} }}", parts.join(", "))
}

/// The result of an update-family command.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
}

/// A per-collection handle borrowed from the [`Database`].
pub struct Collection<'a> {
    db: &'a mut Database,
    name: String,
}

impl Collection<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> String {
        format!("db.{}", self.name)
    }

    fn data_mut(&mut self) -> Result<&mut CollectionData> {
        validate_collection_name(&self.name)?;
        Ok(self
            .db
            .collections
            .entry(self.name.clone())
            .or_insert_with(CollectionData::new))
    }

    fn now_ctx(&self) -> EvalCtx {
        EvalCtx::new(Utc::now().timestamp_millis())
    }

    fn index_snapshot(&self) -> Vec<(String, Document)> {
        self.db
            .collections
            .get(&self.name)
            .map(|data| {
                data.indexes
                    .iter()
                    .map(|spec| (spec.name.clone(), spec.key_document()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reject `doc` if it collides with an existing document under any
    /// unique index. `exclude` skips one slot (the document being
    /// rewritten in place).
    fn check_unique(
        data: &CollectionData,
        namespace: &str,
        doc: &Document,
        exclude: Option<usize>,
        ctx: &EvalCtx,
    ) -> Result<()> {
        for spec in data.indexes.iter().filter(|spec| spec.unique) {
            let Some(key) = unique_key(doc, spec, ctx)? else {
                continue;
            };
            for (slot, existing) in data.docs.iter().enumerate() {
                if Some(slot) == exclude {
                    continue;
                }
                if let Some(existing_key) = unique_key(existing, spec, ctx)? {
                    if existing_key == key {
                        return Err(Error::duplicate_key(
                            namespace,
                            &spec.name,
                            &render_key(&spec.key_fields(), &key),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================
    // Writes
    // ========================================

    /// Insert one document, generating `_id` when absent. Returns the id.
    pub fn insert_one(&mut self, mut doc: Document) -> Result<Value> {
        if !doc.contains_key("_id") {
            let id = self.db.generate_id();
            doc.shift_insert(0, "_id".to_string(), id);
        }
        let ctx = self.now_ctx();
        let namespace = self.namespace();
        let data = self.data_mut()?;
        Self::check_unique(data, &namespace, &doc, None, &ctx)?;
        let id = doc.get("_id").cloned().expect("inserted above");
        data.docs.push(doc);
        Ok(id)
    }

    /// Ordered multi-insert: stops at the first failing document.
    pub fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<Value>> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert_one(doc)?);
        }
        Ok(ids)
    }

    pub fn update_one(&mut self, filter: &Value, spec: &Value, upsert: bool) -> Result<UpdateResult> {
        self.run_update(filter, spec, upsert, true)
    }

    pub fn update_many(&mut self, filter: &Value, spec: &Value, upsert: bool) -> Result<UpdateResult> {
        self.run_update(filter, spec, upsert, false)
    }

    /// `replaceOne(filter, replacement, {upsert})`.
    pub fn replace_one(
        &mut self,
        filter: &Value,
        replacement: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(Error::failed_to_parse(
                "replacement document must not contain update operators",
            ));
        }
        self.run_update(filter, &Value::Object(replacement.clone()), upsert, true)
    }

    fn run_update(
        &mut self,
        filter: &Value,
        spec: &Value,
        upsert: bool,
        single: bool,
    ) -> Result<UpdateResult> {
        let pred = matcher::compile(filter)?;
        let ctx = self.now_ctx();
        let namespace = self.namespace();
        let data = self.data_mut()?;
        let mut matched = 0u64;
        let mut modified = 0u64;
        for slot in 0..data.docs.len() {
            if !matcher::matches(&pred, &Value::Object(data.docs[slot].clone()), &ctx)? {
                continue;
            }
            matched += 1;
            let updated = update::apply(&data.docs[slot], spec)?;
            if updated != data.docs[slot] {
                Self::check_unique(data, &namespace, &updated, Some(slot), &ctx)?;
                data.docs[slot] = updated;
                modified += 1;
            }
            if single {
                break;
            }
        }
        if matched == 0 && upsert {
            let seeded = update::upsert_seed(filter, spec)?;
            let id = self.insert_one(seeded)?;
            return Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(id),
            });
        }
        Ok(UpdateResult {
            matched_count: matched,
            modified_count: modified,
            upserted_id: None,
        })
    }

    pub fn delete_one(&mut self, filter: &Value) -> Result<u64> {
        self.run_delete(filter, true)
    }

    pub fn delete_many(&mut self, filter: &Value) -> Result<u64> {
        self.run_delete(filter, false)
    }

    fn run_delete(&mut self, filter: &Value, single: bool) -> Result<u64> {
        let pred = matcher::compile(filter)?;
        let ctx = self.now_ctx();
        let data = self.data_mut()?;
        let mut deleted = 0u64;
        let mut kept = Vec::with_capacity(data.docs.len());
        for doc in data.docs.drain(..) {
            let hit = (!single || deleted == 0)
                && matcher::matches(&pred, &Value::Object(doc.clone()), &ctx)?;
            if hit {
                deleted += 1;
            } else {
                kept.push(doc);
            }
        }
        data.docs = kept;
        Ok(deleted)
    }

    // ========================================
    // Reads
    // ========================================

    /// `find(filter)` — a buffered cursor over matching documents.
    pub fn find(&mut self, filter: &Value) -> Result<Cursor> {
        let pred = matcher::compile(filter)?;
        let ctx = self.now_ctx();
        let mut out = Vec::new();
        for doc in self.db.collection_docs(&self.name) {
            if matcher::matches(&pred, &Value::Object(doc.clone()), &ctx)? {
                out.push(doc);
            }
        }
        Ok(Cursor {
            docs: out,
            index_catalog: self.index_snapshot(),
        })
    }

    pub fn find_one(&mut self, filter: &Value) -> Result<Option<Document>> {
        Ok(self.find(filter)?.to_array().into_iter().next())
    }

    /// Run an aggregation pipeline with this collection as the source.
    pub fn aggregate(&mut self, stages: &[Value]) -> Result<Cursor> {
        let parsed = pipeline::parse(stages)?;
        let source = self.db.collection_docs(&self.name);
        let ctx = self.now_ctx();
        debug!(
            "aggregate on '{}': {} stages over {} documents",
            self.name,
            parsed.len(),
            source.len()
        );
        let docs = pipeline::execute(&parsed, source, self.db, &ctx)?;
        Ok(Cursor {
            docs,
            index_catalog: self.index_snapshot(),
        })
    }

    pub fn count_documents(&mut self, filter: &Value) -> Result<u64> {
        Ok(self.find(filter)?.to_array().len() as u64)
    }

    /// A collection-scan-free count in a real engine; here, the length.
    pub fn estimated_document_count(&self) -> u64 {
        self.db
            .collections
            .get(&self.name)
            .map(|data| data.docs.len() as u64)
            .unwrap_or(0)
    }

    /// Distinct leaf values of a field across matching documents. Array
    /// values contribute their elements.
    pub fn distinct(&mut self, field: &str, filter: Option<&Value>) -> Result<Vec<Value>> {
        let docs = match filter {
            Some(filter) => self.find(filter)?.to_array(),
            None => self.db.collection_docs(&self.name),
        };
        let segments = path::split(field);
        let mut out: Vec<Value> = Vec::new();
        for doc in docs {
            let mut candidates = Vec::new();
            path::gather(&Value::Object(doc), &segments, &mut candidates);
            for candidate in candidates {
                let values = match candidate {
                    Value::Missing => continue,
                    Value::Array(items) => items,
                    v => vec![v],
                };
                for value in values {
                    if !out.contains(&value) {
                        out.push(value);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.compare(b));
        Ok(out)
    }

    // ========================================
    // Index catalog
    // ========================================

    /// `createIndex(keys, options)` — validates the spec and registers
    /// it. Unique indexes verify the existing data first.
    pub fn create_index(&mut self, keys: &Value, options: Option<&Value>) -> Result<String> {
        let spec = index::parse(keys, options)?;
        let ctx = self.now_ctx();
        let namespace = self.namespace();
        let data = self.data_mut()?;
        if let Some(existing) = data.indexes.iter().find(|i| i.name == spec.name) {
            if existing.key_document() == spec.key_document() {
                return Ok(spec.name);
            }
            return Err(Error::index_spec(format!(
                "An index with name '{}' already exists with a different key pattern",
                spec.name
            )));
        }
        if spec.unique {
            for (slot, doc) in data.docs.iter().enumerate() {
                let Some(key) = unique_key(doc, &spec, &ctx)? else {
                    continue;
                };
                for other in data.docs.iter().skip(slot + 1) {
                    if let Some(other_key) = unique_key(other, &spec, &ctx)? {
                        if other_key == key {
                            return Err(Error::duplicate_key(
                                &namespace,
                                &spec.name,
                                &render_key(&spec.key_fields(), &key),
                            ));
                        }
                    }
                }
            }
        }
        let name = spec.name.clone();
        data.indexes.push(spec);
        Ok(name)
    }

    pub fn create_indexes(&mut self, specs: &[(Value, Option<Value>)]) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(specs.len());
        for (keys, options) in specs {
            names.push(self.create_index(keys, options.as_ref())?);
        }
        Ok(names)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        if name == "_id_" {
            return Err(Error::bad_value("cannot drop _id index"));
        }
        let data = self.data_mut()?;
        let before = data.indexes.len();
        data.indexes.retain(|spec| spec.name != name);
        if data.indexes.len() == before {
            return Err(Error::new(
                27,
                format!("index not found with name [{}]", name),
            ));
        }
        Ok(())
    }

    pub fn drop_indexes(&mut self) -> Result<()> {
        let data = self.data_mut()?;
        data.indexes.retain(|spec| spec.name == "_id_");
        Ok(())
    }

    /// The declared index specs, `_id_` first.
    pub fn indexes(&self) -> Vec<Document> {
        self.db
            .collections
            .get(&self.name)
            .map(|data| data.indexes.iter().map(|spec| spec.describe()).collect())
            .unwrap_or_default()
    }

    // ========================================
    // Admin
    // ========================================

    pub fn drop(self) -> bool {
        self.db.drop_collection(&self.name)
    }

    pub fn rename(self, new_name: &str, drop_target: bool) -> Result<()> {
        self.db.rename_collection(&self.name, new_name, drop_target)
    }

    pub fn stats(&self) -> Document {
        let (count, nindexes) = self
            .db
            .collections
            .get(&self.name)
            .map(|data| (data.docs.len(), data.indexes.len()))
            .unwrap_or((0, 0));
        let mut doc = Document::new();
        doc.insert("ns".to_string(), Value::String(self.namespace()));
        doc.insert("count".to_string(), Value::from_int(count as i64));
        doc.insert("nindexes".to_string(), Value::from_int(nindexes as i64));
        doc
    }
}

/// A buffered result cursor. `sort`/`limit`/`skip`/`hint` consume and
/// return the cursor; `to_array` yields the documents.
#[derive(Debug, Clone)]
pub struct Cursor {
    docs: Vec<Document>,
    index_catalog: Vec<(String, Document)>,
}

impl Cursor {
    pub fn sort(mut self, spec: &Value) -> Result<Cursor> {
        let sort = SortSpec::parse(spec)?;
        self.docs.sort_by(|a, b| sort.compare(a, b));
        Ok(self)
    }

    pub fn limit(mut self, n: usize) -> Cursor {
        self.docs.truncate(n);
        self
    }

    pub fn skip(mut self, n: usize) -> Cursor {
        self.docs.drain(..n.min(self.docs.len()));
        self
    }

    /// Accepts an index name or a key-pattern document. Unknown hints are
    /// a planner error; a valid hint changes nothing here since every
    /// plan is a scan.
    pub fn hint(self, hint: &Value) -> Result<Cursor> {
        let known = match hint {
            Value::String(name) => self.index_catalog.iter().any(|(n, _)| n == name),
            Value::Object(pattern) => self
                .index_catalog
                .iter()
                .any(|(_, keys)| Value::Object(keys.clone()) == Value::Object(pattern.clone())),
            _ => false,
        };
        if !known {
            return Err(Error::bad_value(
                "error processing query: planner returned error: bad hint",
            ));
        }
        Ok(self)
    }

    pub fn to_array(self) -> Vec<Document> {
        self.docs
    }
}

impl IntoIterator for Cursor {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.docs.into_iter()
    }
}
