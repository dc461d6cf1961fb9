//! Field paths
//!
//! A path such as `readings[0].value` is an ordered list of steps: field names
//! and zero-based array indexes. Resolving a path never fails. A step that does
//! not fit the value it lands on (a field name on a scalar, an index past the
//! end, an index into a struct) yields null, so one query can run over records
//! whose nested shape varies between sources.
//!
//! A dotted numeric segment (`readings.0`) names a field when the node is a
//! struct and indexes when the node is a sequence. Structured results are
//! returned as they are; nothing is flattened into text.

use crate::error::SqlError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tidewater_catalog::{FieldType, Schema};
use tidewater_core::Value;

/// One navigation step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    Field(String),
    Index(usize),
}

/// Parsed field-access path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    steps: Vec<PathStep>,
}

impl FieldPath {
    pub fn new(steps: Vec<PathStep>) -> Self {
        Self { steps }
    }

    /// Parse `a.b[0].c`; a leading `$.` is accepted
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| SqlError::InvalidPath {
            path: text.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("$.")
            .or_else(|| trimmed.strip_prefix('$'))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut steps = Vec::new();
        for segment in body.split('.') {
            let (name, mut rest) = match segment.find('[') {
                Some(pos) => segment.split_at(pos),
                None => (segment, ""),
            };
            if name.is_empty() {
                return Err(invalid("missing field name"));
            }
            if name.contains(']') {
                return Err(invalid("unexpected ']'"));
            }
            steps.push(PathStep::Field(name.to_string()));

            while !rest.is_empty() {
                let inner = rest.strip_prefix('[').ok_or_else(|| invalid("expected '['"))?;
                let end = inner.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let index = inner[..end]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("array index must be a non-negative integer"))?;
                steps.push(PathStep::Index(index));
                rest = &inner[end + 1..];
            }
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Last field name, used as the default output name of a projection
    pub fn leaf_name(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| match s {
            PathStep::Field(name) => Some(name.as_str()),
            PathStep::Index(_) => None,
        })
    }

    /// Resolve against a value tree; never fails
    pub fn resolve<'a>(&self, root: &'a Value) -> &'a Value {
        let mut current = root;
        for step in &self.steps {
            current = match (step, current) {
                (PathStep::Field(name), Value::Struct(_)) => {
                    current.field(name).unwrap_or(&Value::NULL)
                }
                (PathStep::Field(name), Value::Seq(items)) => name
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i))
                    .unwrap_or(&Value::NULL),
                (PathStep::Index(i), Value::Seq(items)) => items.get(*i).unwrap_or(&Value::NULL),
                _ => &Value::NULL,
            };
            if current.is_null() {
                break;
            }
        }
        current
    }

    /// Declared type at this path, or `None` when the path leaves the schema
    pub fn resolve_type(&self, schema: &Schema) -> Option<FieldType> {
        let root = schema.as_struct();
        let mut current = &root;
        for step in &self.steps {
            current = match (step, current) {
                (PathStep::Field(name), FieldType::Struct { .. }) => {
                    &current.field(name)?.field_type
                }
                (PathStep::Field(name), FieldType::Array { items }) => {
                    name.parse::<usize>().ok()?;
                    items.as_ref()
                }
                (PathStep::Index(_), FieldType::Array { items }) => items.as_ref(),
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Resolve `path` against `value`
pub fn resolve<'a>(value: &'a Value, path: &FieldPath) -> &'a Value {
    path.resolve(value)
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::Field(name) if i == 0 => write!(f, "{name}")?,
                PathStep::Field(name) => write!(f, ".{name}")?,
                PathStep::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = SqlError;

    fn try_from(s: String) -> Result<Self> {
        FieldPath::parse(&s)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}
