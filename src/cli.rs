//! CLI support for nutmeg
//!
//! Provides programmatic access to the CLI functionality for embedding in
//! other tools and for the `nutmeg` binary.

use std::io;

use crate::collection::Database;
use crate::value::{from_json, to_json};

/// Errors that can occur during CLI operations
#[derive(Debug)]
pub enum CliError {
    /// Engine error (pipeline compilation or execution)
    Engine(crate::Error),
    /// JSON parsing error
    Json(serde_json::Error),
    /// IO error
    Io(io::Error),
    /// No input provided
    NoInput,
    /// The input was not a JSON document or array of documents
    BadInput,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Engine(e) => write!(f, "Engine error: {}", e),
            CliError::Json(e) => write!(f, "Invalid JSON: {}", e),
            CliError::Io(e) => write!(f, "IO error: {}", e),
            CliError::NoInput => write!(f, "No input provided. Use --input or pipe JSON to stdin."),
            CliError::BadInput => {
                write!(f, "Input must be a JSON document or an array of documents.")
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Engine(e) => Some(e),
            CliError::Json(e) => Some(e),
            CliError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<crate::Error> for CliError {
    fn from(e: crate::Error) -> Self {
        CliError::Engine(e)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Json(e)
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::Io(e)
    }
}

/// Options for the `agg` command.
pub struct AggOptions {
    /// The aggregation pipeline, as a JSON array of stages
    pub pipeline: String,
    /// JSON input: one document or an array of documents
    pub input: Option<String>,
}

/// Load the input into a scratch collection, run the pipeline, and return
/// the resulting documents as JSON.
pub fn execute_agg(options: &AggOptions) -> Result<Vec<serde_json::Value>, CliError> {
    let input = options.input.as_ref().ok_or(CliError::NoInput)?;
    let input_json: serde_json::Value = serde_json::from_str(input)?;
    let docs = match from_json(&input_json) {
        crate::Value::Array(items) => items,
        doc @ crate::Value::Object(_) => vec![doc],
        _ => return Err(CliError::BadInput),
    };

    let mut db = Database::new();
    let mut coll = db.collection("docs");
    for doc in docs {
        match doc {
            crate::Value::Object(obj) => {
                coll.insert_one(obj)?;
            }
            _ => return Err(CliError::BadInput),
        }
    }

    let pipeline_json: serde_json::Value = serde_json::from_str(&options.pipeline)?;
    let stages = match from_json(&pipeline_json) {
        crate::Value::Array(stages) => stages,
        single @ crate::Value::Object(_) => vec![single],
        _ => return Err(CliError::BadInput),
    };

    let results = db.collection("docs").aggregate(&stages)?.to_array();
    Ok(results
        .into_iter()
        .map(|doc| to_json(&crate::Value::Object(doc)))
        .collect())
}
