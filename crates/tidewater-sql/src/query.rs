//! Continuous query definitions and the per-record pipeline
//!
//! A [`QueryDefinition`] binds one or more source streams to a target stream.
//! [`QueryPipeline::compile`] checks it against the catalog once; afterwards
//! [`QueryPipeline::process`] turns one input record into at most one output
//! record:
//!
//! 1. decode the payload with the source codec
//! 2. drop the record when the filter is false or null
//! 3. evaluate the projections in declared order
//! 4. compute the key (`partition_by`, else the input key)
//! 5. resolve the event time, from the projected output or the source record
//! 6. encode with the target codec and pick the target partition
//!
//! ## Fan-in
//!
//! Several sources, in one query or across queries, may feed the same target.
//! Each must project to the target's schema (same names, same order, same
//! types); anything else fails with `DuplicateQueryTarget`. A column whose path
//! leaves one source's schema is always null there and takes the type the
//! other sources, or the existing target, give it.

use crate::error::SqlError;
use crate::expr::{Expr, RowContext};
use crate::path::FieldPath;
use crate::router;
use crate::timestamp::{TimestampResolver, TimestampSpec};
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tidewater_catalog::{
    Field, FieldType, RegisteredStream, Schema, SchemaCatalog, SerializationFormat, StreamCodec,
    StreamDefinition,
};
use tidewater_core::{Record, Value};

/// One output column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Output name; defaults to the last field name of a path expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub expr: Expr,
}

impl Projection {
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            name: Some(name.into()),
            expr,
        }
    }

    /// Projection named after its expression
    pub fn unnamed(expr: Expr) -> Self {
        Self { name: None, expr }
    }

    pub fn output_name(&self) -> Option<String> {
        self.name.clone().or_else(|| self.expr.default_name())
    }
}

/// Where a new query starts reading its sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Replay each partition from offset 0
    #[default]
    Earliest,
    /// Only records appended after submission
    Latest,
}

/// Registration request for a continuous query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    /// Assigned by the engine when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub sources: Vec<String>,

    pub target: String,

    pub projections: Vec<Projection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<Expr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampSpec>,

    /// Format of the target when the query creates it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<SerializationFormat>,

    /// Partition count of the target when the query creates it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,

    #[serde(default)]
    pub start: StartPosition,
}

impl QueryDefinition {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            sources: vec![source.into()],
            target: target.into(),
            projections: Vec::new(),
            filter: None,
            partition_by: None,
            timestamp: None,
            format: None,
            partitions: None,
            start: StartPosition::Earliest,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn project(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.projections.push(Projection::new(name, expr));
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn partition_by(mut self, key: Expr) -> Self {
        self.partition_by = Some(key);
        self
    }

    pub fn with_timestamp(mut self, field: FieldPath, format: Option<String>) -> Self {
        self.timestamp = Some(TimestampSpec::new(field, format));
        self
    }

    pub fn with_format(mut self, format: SerializationFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    /// Structural checks that need no catalog
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(SqlError::InvalidQuery("at least one source is required".to_string()));
        }
        if self.projections.is_empty() {
            return Err(SqlError::InvalidQuery(
                "at least one projection is required".to_string(),
            ));
        }

        let mut seen_sources = HashSet::new();
        for source in &self.sources {
            if source == &self.target {
                return Err(SqlError::InvalidQuery(format!(
                    "stream {source} cannot be both source and target"
                )));
            }
            if !seen_sources.insert(source.as_str()) {
                return Err(SqlError::InvalidQuery(format!(
                    "source {source} is listed twice"
                )));
            }
        }

        if self.partitions == Some(0) {
            return Err(SqlError::InvalidQuery(
                "target partition count must be at least 1".to_string(),
            ));
        }

        self.output_names()?;

        for projection in &self.projections {
            projection.expr.validate()?;
        }
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        if let Some(key) = &self.partition_by {
            key.validate()?;
        }
        Ok(())
    }

    /// Output column names in declared order
    pub fn output_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(self.projections.len());
        let mut seen = HashSet::new();
        for (i, projection) in self.projections.iter().enumerate() {
            let name = projection
                .output_name()
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| {
                    SqlError::InvalidQuery(format!(
                        "projection {} ({}) needs a name",
                        i + 1,
                        projection.expr
                    ))
                })?;
            if !seen.insert(name.clone()) {
                return Err(SqlError::InvalidQuery(format!(
                    "duplicate output column {name}"
                )));
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Column types over one source; `None` where the source does not pin one
    fn types_over(&self, source: &Schema) -> Vec<Option<FieldType>> {
        self.projections
            .iter()
            .map(|p| p.expr.output_type(source))
            .collect()
    }

    /// Output columns every source agrees on.
    ///
    /// A column left open by one source takes its type from the others; two
    /// sources pinning different types is a conflict.
    pub async fn output_columns(
        &self,
        catalog: &SchemaCatalog,
    ) -> Result<Vec<(String, Option<FieldType>)>> {
        let names = self.output_names()?;
        if self.sources.is_empty() {
            return Err(SqlError::InvalidQuery("at least one source is required".to_string()));
        }

        // agreed type per column, with the source that first pinned it
        let mut pinned: Vec<Option<(FieldType, &str)>> = vec![None; names.len()];
        for source in &self.sources {
            let types = self.types_over(&catalog.lookup(source).await?);
            for ((name, slot), found) in names.iter().zip(pinned.iter_mut()).zip(types) {
                let Some(found) = found else { continue };
                match slot {
                    Some((expected, first)) if *expected != found => {
                        return Err(SqlError::DuplicateQueryTarget {
                            target: self.target.clone(),
                            reason: format!(
                                "sources {first} and {source} project column {name} as {} and {}",
                                expected.sql_name(),
                                found.sql_name()
                            ),
                        })
                    }
                    Some(_) => {}
                    None => *slot = Some((found, source.as_str())),
                }
            }
        }

        Ok(names
            .into_iter()
            .zip(pinned)
            .map(|(name, slot)| (name, slot.map(|(ty, _)| ty)))
            .collect())
    }

    /// Output schema, after checking every source projects to the same one.
    ///
    /// Columns no source pins are typed as text.
    pub async fn output_schema(&self, catalog: &SchemaCatalog) -> Result<Schema> {
        Ok(Schema::new(
            self.output_columns(catalog)
                .await?
                .into_iter()
                .map(|(name, ty)| Field::new(name, ty.unwrap_or(FieldType::Text)))
                .collect(),
        ))
    }

    /// Definition of the target stream when the query has to create it.
    ///
    /// Format and partition count default to the first source's.
    pub async fn target_definition(&self, catalog: &SchemaCatalog) -> Result<StreamDefinition> {
        let schema = self.output_schema(catalog).await?;
        let first = catalog.get(&self.sources[0]).await?;
        Ok(StreamDefinition::new(self.target.clone(), schema)
            .with_format(self.format.unwrap_or(first.definition.format))
            .with_partitions(self.partitions.unwrap_or(first.definition.partitions)))
    }
}

/// Output of one processed record
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Emitted(OutputRecord),
    /// The filter rejected the record
    Filtered,
}

/// A record ready to be appended to the target
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub partition: u32,
    pub key: Option<Bytes>,
    pub timestamp: i64,
    pub value: Bytes,
}

/// Per-source state of a compiled query
#[derive(Debug)]
pub struct SourceBinding {
    pub name: String,
    pub partitions: u32,
    codec: Arc<StreamCodec>,
    timestamp: TimestampResolver,
}

/// Compiled, immutable form of a query, shared by all of its workers
#[derive(Debug)]
pub struct QueryPipeline {
    sources: Vec<SourceBinding>,
    target: String,
    target_partitions: u32,
    target_codec: Arc<StreamCodec>,
    names: Vec<String>,
    projections: Vec<Expr>,
    filter: Option<Expr>,
    partition_by: Option<Expr>,
}

/// Event-time source for one source stream.
///
/// A query's timestamp field is looked up in the projected output first, then
/// in the source record; the stream's own declared column only in the source.
fn timestamp_resolver(
    definition: &QueryDefinition,
    output: &Schema,
    source: &RegisteredStream,
) -> Result<TimestampResolver> {
    if let Some(spec) = &definition.timestamp {
        if let Some(found) = spec.field.resolve_type(output) {
            check_timestamp_type(spec, &found, &definition.target)?;
            return Ok(TimestampResolver::Output(spec.clone()));
        }
        return match spec.field.resolve_type(&source.definition.schema) {
            Some(found) => {
                check_timestamp_type(spec, &found, &source.definition.name)?;
                Ok(TimestampResolver::Field(spec.clone()))
            }
            None => Err(SqlError::InvalidQuery(format!(
                "timestamp field {} is neither an output column nor a field of {}",
                spec.field, source.definition.name
            ))),
        };
    }
    match &source.definition.timestamp {
        Some(column) => {
            let spec = TimestampSpec::new(FieldPath::parse(&column.field)?, column.format.clone());
            let found = spec
                .field
                .resolve_type(&source.definition.schema)
                .ok_or_else(|| {
                    SqlError::InvalidQuery(format!(
                        "timestamp field {} is not a field of {}",
                        spec.field, source.definition.name
                    ))
                })?;
            check_timestamp_type(&spec, &found, &source.definition.name)?;
            Ok(TimestampResolver::Field(spec))
        }
        None => Ok(TimestampResolver::Inherit),
    }
}

/// A pattern parses text; without one the field must hold epoch millis
fn check_timestamp_type(spec: &TimestampSpec, found: &FieldType, stream: &str) -> Result<()> {
    let expected = match spec.format {
        Some(_) => FieldType::Text,
        None => FieldType::Integer,
    };
    if *found == expected {
        return Ok(());
    }
    Err(SqlError::InvalidQuery(format!(
        "timestamp field {} of {stream} is {}, expected {}{}",
        spec.field,
        found.sql_name(),
        expected.sql_name(),
        if spec.format.is_some() { " for a pattern" } else { " epoch millis" }
    )))
}

impl QueryPipeline {
    /// Compile a query against the catalog. The target must already exist.
    pub async fn compile(definition: &QueryDefinition, catalog: &SchemaCatalog) -> Result<Self> {
        definition.validate()?;

        let columns = definition.output_columns(catalog).await?;

        let target = catalog.get(&definition.target).await?;
        if !fits(&columns, &target.definition.schema) {
            return Err(SqlError::DuplicateQueryTarget {
                target: definition.target.clone(),
                reason: format!(
                    "projection ({}) differs from the existing schema ({})",
                    describe_columns(&columns),
                    describe_schema(&target.definition.schema)
                ),
            });
        }
        if let Some(format) = definition.format {
            if format != target.definition.format {
                return Err(SqlError::DuplicateQueryTarget {
                    target: definition.target.clone(),
                    reason: format!(
                        "requested format {format} but the stream is {}",
                        target.definition.format
                    ),
                });
            }
        }

        let mut sources = Vec::with_capacity(definition.sources.len());
        for name in &definition.sources {
            let stream = catalog.get(name).await?;
            sources.push(SourceBinding {
                name: name.clone(),
                partitions: stream.definition.partitions,
                codec: catalog.codec(name).await?,
                timestamp: timestamp_resolver(definition, &target.definition.schema, &stream)?,
            });
        }

        Ok(Self {
            sources,
            target: definition.target.clone(),
            target_partitions: target.definition.partitions,
            target_codec: catalog.codec(&definition.target).await?,
            names: definition.output_names()?,
            projections: definition.projections.iter().map(|p| p.expr.clone()).collect(),
            filter: definition.filter.clone(),
            partition_by: definition.partition_by.clone(),
        })
    }

    pub fn sources(&self) -> &[SourceBinding] {
        &self.sources
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_partitions(&self) -> u32 {
        self.target_partitions
    }

    pub fn output_schema(&self) -> &Schema {
        self.target_codec.schema()
    }

    /// Run one record of source `source` (an index into [`QueryPipeline::sources`])
    pub fn process(&self, source: usize, record: &Record) -> Result<Outcome> {
        let binding = self.sources.get(source).ok_or_else(|| {
            SqlError::InvalidQuery(format!("query has no source #{source}"))
        })?;

        let value = binding.codec.decode(&record.value)?;
        let row = RowContext {
            value: &value,
            timestamp: record.timestamp,
            key: record.key.as_deref(),
            partition: record.partition,
            offset: record.offset,
        };

        if let Some(filter) = &self.filter {
            match filter.evaluate(&row)? {
                Value::Bool(true) => {}
                Value::Bool(false) | Value::Null => return Ok(Outcome::Filtered),
                other => {
                    return Err(SqlError::EvaluationError(format!(
                        "filter must be boolean, got {}",
                        other.type_name()
                    )))
                }
            }
        }

        let mut columns = Vec::with_capacity(self.projections.len());
        for (name, expr) in self.names.iter().zip(&self.projections) {
            columns.push((name.clone(), expr.evaluate(&row)?));
        }
        let projected = Value::Struct(columns);

        let key = match &self.partition_by {
            Some(expr) => router::key_bytes(&expr.evaluate(&row)?),
            None => record.key.clone(),
        };

        let timestamp = binding
            .timestamp
            .resolve(&value, &projected, record.timestamp)?;

        let encoded = self.target_codec.encode(&projected)?;
        let partition = router::route_record(key.as_deref(), record.partition, self.target_partitions);

        Ok(Outcome::Emitted(OutputRecord {
            partition,
            key,
            timestamp,
            value: encoded,
        }))
    }
}

/// Same names in the same order; open columns accept any declared type
fn fits(columns: &[(String, Option<FieldType>)], schema: &Schema) -> bool {
    columns.len() == schema.fields.len()
        && columns.iter().zip(&schema.fields).all(|((name, ty), field)| {
            name == &field.name && ty.as_ref().map_or(true, |ty| ty == &field.field_type)
        })
}

fn describe_columns(columns: &[(String, Option<FieldType>)]) -> String {
    columns
        .iter()
        .map(|(name, ty)| match ty {
            Some(ty) => format!("{name} {}", ty.sql_name()),
            None => format!("{name} ANY"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_schema(schema: &Schema) -> String {
    schema
        .fields
        .iter()
        .map(|f| format!("{} {}", f.name, f.field_type.sql_name()))
        .collect::<Vec<_>>()
        .join(", ")
}
