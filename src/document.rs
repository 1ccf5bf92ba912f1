//! Document tree and the closed set of mutation operations.
//!
//! A document is a nested mapping of string keys to values, arrays, or
//! scalars (`serde_json::Value`). Operations address fields by dotted
//! path ("sections.intro.title") and carry last-writer-wins semantics at
//! the field level:
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | `set` | assign value at path, lazily creating intermediate objects |
//! | `array-insert` | insert into an existing array, index clamped to `[0, len]` |
//! | `array-remove` | remove from an existing array, out-of-bounds is a no-op |
//!
//! `apply` is deterministic and synchronous: replaying the same operation
//! sequence against the same starting state always produces the same
//! document, which is what makes version-stamped broadcast sufficient for
//! convergence.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document: opaque metadata plus the editable data payload.
///
/// The sync core never interprets `metadata` — it belongs to the
/// surrounding application (schema name, file provenance, and so on).
/// All operations target `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub data: Value,
}

impl Document {
    /// Create a document from a data payload.
    pub fn new(data: Value) -> Self {
        Self {
            metadata: Map::new(),
            data,
        }
    }

    /// Create a document with metadata and data.
    pub fn with_metadata(metadata: Map<String, Value>, data: Value) -> Self {
        Self { metadata, data }
    }

    /// Apply a single operation to this document's data payload.
    ///
    /// Fails without modifying the document when an array operation
    /// targets a path that does not resolve to an array.
    pub fn apply(&mut self, op: &Operation) -> Result<(), OperationError> {
        match op {
            Operation::Set { path, value } => {
                let segments = split_path(path)?;
                apply_set(&mut self.data, &segments, value.clone());
                Ok(())
            }
            Operation::ArrayInsert { path, index, value } => {
                let arr = resolve_array_mut(&mut self.data, path)?;
                let at = (*index).min(arr.len());
                arr.insert(at, value.clone());
                Ok(())
            }
            Operation::ArrayRemove { path, index } => {
                let arr = resolve_array_mut(&mut self.data, path)?;
                // Out-of-bounds removal commits as a no-op; the version
                // stays monotonic.
                if *index < arr.len() {
                    arr.remove(*index);
                }
                Ok(())
            }
        }
    }

    /// Read the value at a dotted path, if it resolves.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments = split_path(path).ok()?;
        let mut current = &self.data;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self {
            metadata: Map::new(),
            data: Value::Object(Map::new()),
        }
    }
}

/// An atomic, typed document mutation.
///
/// The wire representation is tagged (`{"type": "set", ...}`) so payloads
/// stay self-describing alongside their arbitrary JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Operation {
    /// Assign `value` at `path`, creating intermediate objects as needed.
    Set { path: String, value: Value },
    /// Insert `value` into the array at `path` at `index` (clamped).
    ArrayInsert {
        path: String,
        index: usize,
        value: Value,
    },
    /// Remove the element at `index` from the array at `path`.
    ArrayRemove { path: String, index: usize },
}

impl Operation {
    /// The dotted field path this operation targets.
    pub fn path(&self) -> &str {
        match self {
            Operation::Set { path, .. } => path,
            Operation::ArrayInsert { path, .. } => path,
            Operation::ArrayRemove { path, .. } => path,
        }
    }
}

/// Failure to apply an operation to a document.
///
/// These are reported to the operation's author only; a failed operation
/// is never broadcast and never advances the session version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Empty path or empty path segment.
    InvalidPath { path: String },
    /// An array operation's path does not resolve.
    PathNotFound { path: String },
    /// An array operation's target exists but is not an array.
    NotAnArray { path: String },
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPath { path } => write!(f, "Invalid field path: {path:?}"),
            Self::PathNotFound { path } => write!(f, "Path does not resolve: {path:?}"),
            Self::NotAnArray { path } => write!(f, "Target at {path:?} is not an array"),
        }
    }
}

impl std::error::Error for OperationError {}

/// Split a dotted path into segments, rejecting empty ones.
fn split_path(path: &str) -> Result<Vec<&str>, OperationError> {
    if path.is_empty() {
        return Err(OperationError::InvalidPath {
            path: path.to_string(),
        });
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OperationError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(segments)
}

/// Walk to the parent of the final segment, creating intermediate objects,
/// then assign. A non-object encountered mid-path is replaced by a fresh
/// object (field-level last-writer-wins).
fn apply_set(data: &mut Value, segments: &[&str], value: Value) {
    let mut current = data;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    let Value::Object(map) = current else { return };
    map.insert(segments[segments.len() - 1].to_string(), value);
}

/// Resolve a dotted path to a mutable array reference.
fn resolve_array_mut<'a>(
    data: &'a mut Value,
    path: &str,
) -> Result<&'a mut Vec<Value>, OperationError> {
    let segments = split_path(path)?;
    let mut current = data;
    for segment in segments {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(segment))
            .ok_or_else(|| OperationError::PathNotFound {
                path: path.to_string(),
            })?;
    }
    current.as_array_mut().ok_or_else(|| OperationError::NotAnArray {
        path: path.to_string(),
    })
}
