//! Schema evolution for sink tables.
//!
//! Feeds grow fields over time. When a feed's shape differs from the stored
//! table schema the two are reconciled according to `SchemaEvolutionMode`:
//! new nullable fields are appended (also inside nested structs and list
//! items), numeric and timestamp types may widen, anything else is rejected.

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SchemaError;

/// Schema evolution mode determining how schema changes are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaEvolutionMode {
    /// Reject any schema changes.
    Strict,
    /// Allow adding nullable columns and widening types (default).
    #[default]
    Merge,
    /// Replace the schema with the incoming one.
    Overwrite,
}

/// Result of comparing a table schema with an incoming schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaComparison {
    /// Top-level fields only present in the incoming schema.
    pub new_fields: Vec<Field>,
    /// Top-level fields only present in the table schema.
    pub missing_fields: Vec<Field>,
    /// Fields whose type changes in an allowed way (widening or nested additions).
    pub widened_fields: Vec<String>,
    /// Incompatible changes: (field path, reason).
    pub conflicts: Vec<(String, String)>,
}

impl SchemaComparison {
    /// Whether the incoming schema adds nothing to the table schema.
    pub fn is_covered(&self) -> bool {
        self.new_fields.is_empty() && self.widened_fields.is_empty() && self.conflicts.is_empty()
    }

    /// Whether the table schema can absorb the incoming one.
    pub fn is_compatible(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Describes what to do to the stored table schema.
#[derive(Debug, Clone)]
pub enum EvolutionAction {
    /// The stored schema already covers the incoming one.
    None,
    /// Replace the stored schema with a merged superset.
    Merge { new_schema: SchemaRef },
    /// Replace the stored schema with the incoming schema.
    Overwrite { new_schema: SchemaRef },
}

/// Compare a table schema against an incoming schema.
pub fn compare_schemas(table: &Schema, incoming: &Schema) -> SchemaComparison {
    let table_fields: HashMap<&str, &Field> = table
        .fields()
        .iter()
        .map(|f| (f.name().as_str(), f.as_ref()))
        .collect();

    let mut comparison = SchemaComparison::default();

    for field in incoming.fields() {
        match table_fields.get(field.name().as_str()) {
            None => {
                if !field.is_nullable() {
                    comparison.conflicts.push((
                        field.name().clone(),
                        "new field is not nullable".to_string(),
                    ));
                }
                comparison.new_fields.push(field.as_ref().clone());
            }
            Some(existing) => match merge_field(existing, field, field.name()) {
                Ok(merged) if merged != **existing => {
                    comparison.widened_fields.push(field.name().clone())
                }
                Ok(_) => {}
                Err((path, reason)) => comparison.conflicts.push((path, reason)),
            },
        }
    }

    let incoming_names: Vec<&str> = incoming.fields().iter().map(|f| f.name().as_str()).collect();
    comparison.missing_fields = table
        .fields()
        .iter()
        .filter(|f| !incoming_names.contains(&f.name().as_str()))
        .map(|f| f.as_ref().clone())
        .collect();

    comparison
}

/// Merge a table schema with an incoming schema.
///
/// Keeps every table field in place (widened where allowed) and appends new
/// nullable fields from the incoming schema. Metadata of the table wins.
pub fn merge_schemas(table: &Schema, incoming: &Schema) -> Result<SchemaRef, SchemaError> {
    let incoming_fields: HashMap<&str, &Field> = incoming
        .fields()
        .iter()
        .map(|f| (f.name().as_str(), f.as_ref()))
        .collect();

    let mut merged: Vec<Field> = Vec::with_capacity(table.fields().len());
    for field in table.fields() {
        match incoming_fields.get(field.name().as_str()) {
            Some(update) => merged.push(merge_field(field, update, field.name()).map_err(into_error)?),
            None => merged.push(field.as_ref().clone()),
        }
    }

    for field in incoming.fields() {
        if table.field_with_name(field.name()).is_err() {
            if !field.is_nullable() {
                return Err(SchemaError::RequiredFieldAddition {
                    field_name: field.name().clone(),
                });
            }
            merged.push(field.as_ref().clone());
        }
    }

    Ok(Arc::new(Schema::new_with_metadata(
        merged,
        table.metadata().clone(),
    )))
}

/// Decide how the stored schema must change to accept `incoming`.
pub fn plan_evolution(
    table: &Schema,
    incoming: &Schema,
    mode: SchemaEvolutionMode,
) -> Result<EvolutionAction, SchemaError> {
    let comparison = compare_schemas(table, incoming);

    match mode {
        _ if comparison.is_covered() => Ok(EvolutionAction::None),
        SchemaEvolutionMode::Strict => Err(SchemaError::IncompatibleSchema {
            details: describe(&comparison),
        }),
        SchemaEvolutionMode::Merge => {
            if let Some((path, reason)) = comparison.conflicts.first() {
                return Err(into_error((path.clone(), reason.clone())));
            }
            Ok(EvolutionAction::Merge {
                new_schema: merge_schemas(table, incoming)?,
            })
        }
        SchemaEvolutionMode::Overwrite => Ok(EvolutionAction::Overwrite {
            new_schema: Arc::new(incoming.clone()),
        }),
    }
}

type Conflict = (String, String);

fn into_error((path, reason): Conflict) -> SchemaError {
    if reason == "new field is not nullable" {
        SchemaError::RequiredFieldAddition { field_name: path }
    } else if let Some((from, to)) = reason.split_once(" -> ") {
        SchemaError::TypeChangeNotAllowed {
            field: path,
            from: from.to_string(),
            to: to.to_string(),
        }
    } else {
        SchemaError::IncompatibleSchema {
            details: format!("{path}: {reason}"),
        }
    }
}

fn merge_field(existing: &Field, incoming: &Field, path: &str) -> Result<Field, Conflict> {
    let data_type = merge_types(existing.data_type(), incoming.data_type(), path)?;
    Ok(existing
        .clone()
        .with_data_type(data_type)
        .with_nullable(existing.is_nullable() || incoming.is_nullable()))
}

fn merge_types(existing: &DataType, incoming: &DataType, path: &str) -> Result<DataType, Conflict> {
    if existing == incoming {
        return Ok(existing.clone());
    }

    match (existing, incoming) {
        (DataType::List(a), DataType::List(b)) => Ok(DataType::List(Arc::new(merge_field(
            a,
            b,
            &format!("{path}[]"),
        )?))),
        (DataType::Struct(a), DataType::Struct(b)) => {
            Ok(DataType::Struct(merge_struct_fields(a, b, path)?))
        }
        _ if is_type_widening(existing, incoming) => Ok(incoming.clone()),
        _ => Err((path.to_string(), format!("{existing:?} -> {incoming:?}"))),
    }
}

fn merge_struct_fields(existing: &Fields, incoming: &Fields, path: &str) -> Result<Fields, Conflict> {
    let mut merged: Vec<Field> = Vec::with_capacity(existing.len());
    for field in existing {
        let child_path = format!("{path}.{}", field.name());
        match incoming.find(field.name()) {
            Some((_, update)) => merged.push(merge_field(field, update, &child_path)?),
            None => merged.push(field.as_ref().clone()),
        }
    }
    for field in incoming {
        if existing.find(field.name()).is_none() {
            if !field.is_nullable() {
                return Err((
                    format!("{path}.{}", field.name()),
                    "new field is not nullable".to_string(),
                ));
            }
            merged.push(field.as_ref().clone());
        }
    }
    Ok(Fields::from(merged))
}

/// Lossless type changes a stored table may absorb.
///
/// - Signed integers: Int8 -> Int16 -> Int32 -> Int64
/// - Unsigned integers: UInt8 -> UInt16 -> UInt32 -> UInt64
/// - Floats: Float32 -> Float64
/// - Dates: Date32 -> Date64
/// - Timestamps with the same zone, towards finer units
fn is_type_widening(from: &DataType, to: &DataType) -> bool {
    if let (DataType::Timestamp(from_unit, from_tz), DataType::Timestamp(to_unit, to_tz)) =
        (from, to)
    {
        return from_tz == to_tz && unit_rank(from_unit) < unit_rank(to_unit);
    }

    matches!(
        (from, to),
        (DataType::Int8, DataType::Int16 | DataType::Int32 | DataType::Int64)
            | (DataType::Int16, DataType::Int32 | DataType::Int64)
            | (DataType::Int32, DataType::Int64)
            | (
                DataType::UInt8,
                DataType::UInt16 | DataType::UInt32 | DataType::UInt64
            )
            | (DataType::UInt16, DataType::UInt32 | DataType::UInt64)
            | (DataType::UInt32, DataType::UInt64)
            | (DataType::Float32, DataType::Float64)
            | (DataType::Date32, DataType::Date64)
    )
}

fn unit_rank(unit: &TimeUnit) -> u8 {
    match unit {
        TimeUnit::Second => 0,
        TimeUnit::Millisecond => 1,
        TimeUnit::Microsecond => 2,
        TimeUnit::Nanosecond => 3,
    }
}

fn describe(comparison: &SchemaComparison) -> String {
    let mut parts = Vec::new();

    if !comparison.new_fields.is_empty() {
        let names: Vec<_> = comparison.new_fields.iter().map(|f| f.name()).collect();
        parts.push(format!("new fields: {names:?}"));
    }
    if !comparison.widened_fields.is_empty() {
        parts.push(format!("changed fields: {:?}", comparison.widened_fields));
    }
    for (path, reason) in &comparison.conflicts {
        parts.push(format!("{path}: {reason}"));
    }

    parts.join("; ")
}
