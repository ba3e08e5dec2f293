//! Schema gate for request payloads.
//!
//! Loads a named JSON-Schema document from the schema directory and checks
//! a payload against it. Violations are collected, put into document order
//! and rendered in a fixed message format that callers match on:
//!
//! - type mismatch: `<field>: expected type: <Expected>, found: <Actual>`
//! - missing field: `required key [<field>] not found`
//!
//! Properties the schema does not declare never cause a rejection unless
//! the schema itself says so.

use crate::fixture::{FixtureError, FixtureStore};
use jsonschema::error::{TypeKind, ValidationErrorKind};
use jsonschema::primitive_type::PrimitiveType;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Category of a single violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TypeMismatch,
    MissingRequired,
    Other,
}

/// One way in which a document fails its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// Dotted locator of the offending field (`(root)` for the document itself)
    pub path: String,
    pub kind: ViolationKind,
    pub message: String,
}

/// A rejected document: at least one violation, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    violations: Vec<SchemaViolation>,
}

impl ValidationFailure {
    /// Wrap a violation list; `None` when the list is empty (document accepted).
    pub fn from_violations(violations: Vec<SchemaViolation>) -> Option<Self> {
        if violations.is_empty() {
            None
        } else {
            Some(Self { violations })
        }
    }

    /// The ordered violations.
    pub fn violations(&self) -> &[SchemaViolation] {
        &self.violations
    }

    /// All violation messages joined into a single line.
    pub fn message(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for ValidationFailure {}

/// The schema text itself could not be used.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvalidSchema(pub String);

/// Errors surfaced by the gate.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema file could not be read.
    #[error("schema {name} unavailable: {source}")]
    Unavailable {
        name: String,
        #[source]
        source: FixtureError,
    },

    /// The schema file was read but is not a usable schema.
    #[error("schema {name} is invalid: {source}")]
    Invalid {
        name: String,
        #[source]
        source: InvalidSchema,
    },

    /// The document does not satisfy the schema.
    #[error("payload failed validation: {0}")]
    Validation(#[from] ValidationFailure),
}

/// Structural validator behind the gate.
pub trait SchemaValidator: Send + Sync {
    /// Check `document` against `schema_text`, returning every violation in
    /// document order. An empty list means the document is accepted.
    fn validate(
        &self,
        document: &Value,
        schema_text: &str,
    ) -> Result<Vec<SchemaViolation>, InvalidSchema>;
}

/// [`SchemaValidator`] backed by the `jsonschema` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(
        &self,
        document: &Value,
        schema_text: &str,
    ) -> Result<Vec<SchemaViolation>, InvalidSchema> {
        let schema: Value = serde_json::from_str(schema_text)
            .map_err(|e| InvalidSchema(format!("invalid JSON: {e}")))?;
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| InvalidSchema(e.to_string()))?;

        let mut keyed: Vec<(Vec<usize>, SchemaViolation)> = validator
            .iter_errors(document)
            .map(|error| {
                let mut segments = pointer_segments(&error.instance_path.to_string());
                let violation = match &error.kind {
                    ValidationErrorKind::Type { kind } => {
                        let field = dotted(&segments);
                        let message = format!(
                            "{field}: expected type: {}, found: {}",
                            expected_type_name(kind),
                            found_type_name(&error.instance)
                        );
                        SchemaViolation {
                            path: field,
                            kind: ViolationKind::TypeMismatch,
                            message,
                        }
                    }
                    ValidationErrorKind::Required { property } => {
                        let key = property
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| property.to_string());
                        let message = format!("required key [{key}] not found");
                        segments.push(key);
                        SchemaViolation {
                            path: dotted(&segments),
                            kind: ViolationKind::MissingRequired,
                            message,
                        }
                    }
                    _ => SchemaViolation {
                        path: dotted(&segments),
                        kind: ViolationKind::Other,
                        message: error.to_string(),
                    },
                };
                (document_position(document, &segments), violation)
            })
            .collect();

        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, v)| v).collect())
    }
}

/// Opt-in validation checkpoint for request payloads.
#[derive(Clone)]
pub struct SchemaGate {
    store: FixtureStore,
    validator: Arc<dyn SchemaValidator>,
}

impl SchemaGate {
    /// Gate reading schemas from `store` and checking them with `validator`.
    pub fn new(store: FixtureStore, validator: Arc<dyn SchemaValidator>) -> Self {
        Self { store, validator }
    }

    /// Gate using the `jsonschema`-backed validator.
    pub fn with_default_validator(store: FixtureStore) -> Self {
        Self::new(store, Arc::new(JsonSchemaValidator))
    }

    /// Validate `document` against the schema called `schema_name`.
    ///
    /// Without a schema name the document is accepted unchanged.
    pub async fn validate(
        &self,
        document: &Value,
        schema_name: Option<&str>,
    ) -> Result<(), SchemaError> {
        let Some(name) = schema_name else {
            return Ok(());
        };

        let schema_text = self
            .store
            .read(name)
            .await
            .map_err(|source| SchemaError::Unavailable {
                name: name.to_string(),
                source,
            })?;

        let violations = self
            .validator
            .validate(document, &schema_text)
            .map_err(|source| SchemaError::Invalid {
                name: name.to_string(),
                source,
            })?;

        match ValidationFailure::from_violations(violations) {
            None => {
                debug!(schema = %name, "Payload accepted");
                Ok(())
            }
            Some(failure) => {
                debug!(
                    schema = %name,
                    violations = failure.violations().len(),
                    "Payload rejected"
                );
                Err(failure.into())
            }
        }
    }
}

/// Split a JSON pointer into unescaped segments.
fn pointer_segments(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect()
}

fn dotted(segments: &[String]) -> String {
    if segments.is_empty() {
        "(root)".to_string()
    } else {
        segments.join(".")
    }
}

/// Sort key placing a location where it appears while walking the document.
/// Locations that do not exist in the document (missing keys) sort after
/// every existing sibling.
fn document_position(document: &Value, segments: &[String]) -> Vec<usize> {
    let mut position = Vec::with_capacity(segments.len());
    let mut current = Some(document);
    for segment in segments {
        let (index, next) = match current {
            Some(Value::Object(map)) => match map.keys().position(|k| k == segment) {
                Some(i) => (i, map.get(segment.as_str())),
                None => (usize::MAX, None),
            },
            Some(Value::Array(items)) => match segment.parse::<usize>() {
                Ok(i) if i < items.len() => (i, items.get(i)),
                _ => (usize::MAX, None),
            },
            _ => (usize::MAX, None),
        };
        position.push(index);
        current = next;
    }
    position
}

/// Expected type name(s) carried by a `type` error. Several allowed types
/// are listed in a fixed order, independent of how the schema spells them.
fn expected_type_name(kind: &TypeKind) -> String {
    match kind {
        TypeKind::Single(primitive) => primitive_type_name(*primitive).to_string(),
        TypeKind::Multiple(primitives) => {
            let names: Vec<&str> = (*primitives).into_iter().map(primitive_type_name).collect();
            format!("one of [{}]", names.join(", "))
        }
    }
}

fn primitive_type_name(primitive: PrimitiveType) -> &'static str {
    match primitive {
        PrimitiveType::Null => "Null",
        PrimitiveType::Boolean => "Boolean",
        PrimitiveType::Integer => "Integer",
        PrimitiveType::Number => "Number",
        PrimitiveType::String => "String",
        PrimitiveType::Array => "JSONArray",
        PrimitiveType::Object => "JSONObject",
    }
}

fn found_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Integer",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "JSONArray",
        Value::Object(_) => "JSONObject",
    }
}
