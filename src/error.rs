use std::fmt;

/// An engine error: an integer code for the known categories plus a
/// human-readable message. Callers pattern-match on stable substrings of
/// the message, so wording changes here are breaking changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub mod code {
    pub const BAD_VALUE: i32 = 2;
    pub const FAILED_TO_PARSE: i32 = 9;
    pub const TYPE_MISMATCH: i32 = 14;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const NAMESPACE_EXISTS: i32 = 48;
    pub const INDEX_SPEC_VALIDATION: i32 = 67;
    pub const INVALID_NAMESPACE: i32 = 73;
    pub const CONVERSION_FAILURE: i32 = 241;
    pub const DUPLICATE_KEY: i32 = 11000;
}

impl Error {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
        }
    }

    /// Malformed stage specs, invalid operator arguments, domain violations.
    pub fn bad_value(message: impl Into<String>) -> Self {
        Error::new(code::BAD_VALUE, message)
    }

    /// An operand had the wrong type for the operator.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Error::new(code::TYPE_MISMATCH, message)
    }

    /// Unparseable input (numbers from strings, pipeline structure).
    pub fn failed_to_parse(message: impl Into<String>) -> Self {
        Error::new(
            code::FAILED_TO_PARSE,
            format!("Failed to parse: {}", message.into()),
        )
    }

    pub fn conversion_failure(message: impl Into<String>) -> Self {
        Error::new(code::CONVERSION_FAILURE, message)
    }

    pub fn namespace_not_found(name: &str) -> Self {
        Error::new(
            code::NAMESPACE_NOT_FOUND,
            format!("ns not found: namespace {} does not exist", name),
        )
    }

    pub fn namespace_exists(name: &str) -> Self {
        Error::new(
            code::NAMESPACE_EXISTS,
            format!("namespace {} already exists", name),
        )
    }

    pub fn invalid_namespace(message: impl Into<String>) -> Self {
        Error::new(code::INVALID_NAMESPACE, message)
    }

    pub fn index_spec(message: impl Into<String>) -> Self {
        Error::new(code::INDEX_SPEC_VALIDATION, message)
    }

    pub fn duplicate_key(namespace: &str, index: &str, key: &str) -> Self {
        Error::new(
            code::DUPLICATE_KEY,
            format!(
                "E11000 duplicate key error collection: {} index: {} dup key: {}",
                namespace, index, key
            ),
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for Error {}
