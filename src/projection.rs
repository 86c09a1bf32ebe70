//! The projection engine: `$project` inclusion/exclusion rewriting,
//! computed fields, and the `$addFields`/`$set` overlay.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::eval::EvalCtx;
use crate::expr::{self, Expr};
use crate::path;
use crate::value::{Document, Value};

/// A compiled `$project` specification.
#[derive(Debug, Clone)]
pub enum Projection {
    Include {
        /// Plain inclusion paths, as a prefix tree built in spec order
        tree: IncludeNode,
        /// Computed fields in spec order
        computed: Vec<(Vec<String>, Expr)>,
        include_id: bool,
    },
    Exclude {
        paths: Vec<Vec<String>>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct IncludeNode {
    children: IndexMap<String, IncludeNode>,
    leaf: bool,
}

impl IncludeNode {
    fn insert(&mut self, segments: &[String]) {
        match segments.split_first() {
            None => self.leaf = true,
            Some((first, rest)) => {
                self.children.entry(first.clone()).or_default().insert(rest);
            }
        }
    }
}

enum FieldKind {
    Include,
    Exclude,
    Computed(Expr),
}

fn classify(spec: &Value) -> Result<FieldKind> {
    Ok(match spec {
        Value::Bool(false) => FieldKind::Exclude,
        Value::Bool(true) => FieldKind::Include,
        n if n.is_number() => {
            if n.as_f64() == Some(0.0) {
                FieldKind::Exclude
            } else {
                FieldKind::Include
            }
        }
        other => FieldKind::Computed(expr::compile(other)?),
    })
}

/// Flatten a projection spec into `(dotted path, kind)` entries. Nested
/// objects without operator keys are sub-projections (`{a: {b: 1}}` means
/// `"a.b": 1`).
fn flatten(
    prefix: &mut Vec<String>,
    spec: &Document,
    out: &mut Vec<(Vec<String>, FieldKind)>,
) -> Result<()> {
    for (field, value) in spec {
        prefix.push(field.clone());
        match value {
            Value::Object(inner)
                if !inner.is_empty() && inner.keys().all(|k| !k.starts_with('$')) =>
            {
                flatten(prefix, inner, out)?;
            }
            other => out.push((prefix.clone(), classify(other)?)),
        }
        prefix.pop();
    }
    Ok(())
}

/// Compile a `$project` spec. Inclusion and exclusion must not mix, with
/// the single exception of `_id: 0` alongside inclusions.
pub fn compile(spec: &Value) -> Result<Projection> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$project specification must be an object"));
    };
    if doc.is_empty() {
        return Err(Error::bad_value(
            "$project specification must have at least one field",
        ));
    }
    let mut entries = Vec::new();
    flatten(&mut Vec::new(), doc, &mut entries)?;

    let mut include_id = true;
    let mut inclusions: Vec<(Vec<String>, Option<Expr>)> = Vec::new();
    let mut exclusions: Vec<Vec<String>> = Vec::new();
    for (segments, kind) in entries {
        let is_id = segments.len() == 1 && segments[0] == "_id";
        match kind {
            FieldKind::Exclude => {
                if is_id {
                    include_id = false;
                } else {
                    exclusions.push(segments);
                }
            }
            FieldKind::Include => inclusions.push((segments, None)),
            FieldKind::Computed(e) => inclusions.push((segments, Some(e))),
        }
    }
    match (inclusions.is_empty(), exclusions.is_empty()) {
        (false, false) => Err(Error::bad_value(format!(
            "Cannot do exclusion on field {} in inclusion projection",
            exclusions[0].join(".")
        ))),
        (true, _) => {
            let mut paths = exclusions;
            if !include_id {
                paths.push(vec!["_id".to_string()]);
            }
            Ok(Projection::Exclude { paths })
        }
        (false, true) => {
            let mut tree = IncludeNode::default();
            let mut computed = Vec::new();
            for (segments, maybe_expr) in inclusions {
                match maybe_expr {
                    None => tree.insert(&segments),
                    Some(e) => computed.push((segments, e)),
                }
            }
            Ok(Projection::Include { tree, computed, include_id })
        }
    }
}

/// Apply a projection to one document.
pub fn apply(projection: &Projection, doc: &Document, ctx: &EvalCtx) -> Result<Document> {
    match projection {
        Projection::Exclude { paths } => {
            let mut out = doc.clone();
            for segments in paths {
                path::remove_path(&mut out, segments);
            }
            Ok(out)
        }
        Projection::Include { tree, computed, include_id } => {
            let mut effective = tree.clone();
            if *include_id {
                effective.insert(&["_id".to_string()]);
            }
            let mut out = project_object(doc, &effective);
            if !computed.is_empty() {
                for (segments, field_expr) in computed {
                    let value = ctx.eval_on(field_expr, Value::Object(doc.clone()))?;
                    if !value.is_missing() {
                        path::set_path(&mut out, segments, value);
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Walk the document in field order, keeping what the inclusion tree
/// names. Arrays are preserved structurally: object elements project
/// recursively, other elements are dropped below a leafless node.
fn project_object(doc: &Document, node: &IncludeNode) -> Document {
    let mut out = Document::new();
    for (field, value) in doc {
        let Some(child) = node.children.get(field) else {
            continue;
        };
        if child.leaf {
            out.insert(field.clone(), value.clone());
        } else if let Some(projected) = project_value(value, child) {
            out.insert(field.clone(), projected);
        }
    }
    out
}

fn project_value(value: &Value, node: &IncludeNode) -> Option<Value> {
    match value {
        Value::Object(inner) => Some(Value::Object(project_object(inner, node))),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(_) | Value::Array(_) => project_value(item, node),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

/// A compiled `$addFields`/`$set` stage: computed fields overlaid onto the
/// document, in spec order. Later fields see the effect of earlier ones.
#[derive(Debug, Clone)]
pub struct AddFields {
    fields: Vec<(Vec<String>, Expr)>,
}

pub fn compile_add_fields(spec: &Value) -> Result<AddFields> {
    let Value::Object(doc) = spec else {
        return Err(Error::bad_value("$addFields specification must be an object"));
    };
    if doc.is_empty() {
        return Err(Error::bad_value(
            "$addFields specification must have at least one field",
        ));
    }
    let mut entries = Vec::new();
    flatten(&mut Vec::new(), doc, &mut entries)?;
    let mut fields = Vec::with_capacity(entries.len());
    for (segments, kind) in entries {
        match kind {
            // Exclusion syntax is meaningless in an overlay.
            FieldKind::Exclude => {
                return Err(Error::bad_value(format!(
                    "Invalid $addFields :: the value 0 for field {} is not an expression",
                    segments.join(".")
                )));
            }
            FieldKind::Include => {
                fields.push((segments, Expr::Literal(Value::Bool(true))));
            }
            FieldKind::Computed(e) => fields.push((segments, e)),
        }
    }
    Ok(AddFields { fields })
}

pub fn apply_add_fields(add: &AddFields, doc: &Document, ctx: &EvalCtx) -> Result<Document> {
    let mut out = doc.clone();
    for (segments, field_expr) in &add.fields {
        let value = ctx.eval_on(field_expr, Value::Object(out.clone()))?;
        if !value.is_missing() {
            path::set_path(&mut out, segments, value);
        }
    }
    Ok(out)
}
