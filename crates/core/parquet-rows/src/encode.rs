//! Message to [`Row`] flattening.
//!
//! The walk follows the [`MessagePlan`] of the table. Three levels travel down the recursion:
//!
//! - `repetition_level`: level emitted by the next value of each column, the inherited level for
//!   the first element of a list and the list depth for the following ones.
//! - `definition_level`: number of optional or repeated ancestors that are present.
//! - `repeated_depth`: number of repeated ancestors, the level at which a new element repeats.
//!
//! An absent optional field or an empty list emits one null for every leaf column below it, at
//! the levels of the parent.

use bytes::Bytes;
use prost_reflect::{DynamicMessage, ReflectMessage, Value};

use crate::{
    error::RowError,
    row::{LeafValue, LeveledValue, Row},
    schema::{FieldNode, FieldPlan, LeafKind, MessagePlan, Repetition, TableSchema},
};

/// Flattens `message` into a single row of `table`.
///
/// The message must be an instance of the table message. Fails on the first field that cannot
/// be converted, no partial row is returned.
pub fn encode_message(table: &TableSchema, message: &DynamicMessage) -> Result<Row, RowError> {
    let expected = table.message();
    if message.descriptor().full_name() != expected.full_name() {
        return Err(RowError::UnexpectedValue {
            field: table.name().to_string(),
            expected: "an instance of the table message",
        });
    }

    let mut ctx = RecursionContext::default();
    ctx.message(table.plan(), message)?;
    Ok(Row::from_values(ctx.values))
}

#[derive(Debug, Default)]
struct RecursionContext {
    repetition_level: i16,
    definition_level: i16,
    repeated_depth: i16,
    values: Vec<LeveledValue>,
}

impl RecursionContext {
    fn message(&mut self, plan: &MessagePlan, message: &DynamicMessage) -> Result<(), RowError> {
        for field in &plan.fields {
            match field.repetition {
                Repetition::Required => {
                    let value = message.get_field(&field.descriptor);
                    self.present(field, &value)?;
                }
                Repetition::Optional => {
                    if !message.has_field(&field.descriptor) {
                        self.nulls(field);
                        continue;
                    }

                    let value = message.get_field(&field.descriptor);
                    self.definition_level += 1;
                    let result = self.present(field, &value);
                    self.definition_level -= 1;
                    result?;
                }
                Repetition::Repeated => {
                    let value = message.get_field(&field.descriptor);
                    let Some(elements) = value.as_list() else {
                        return Err(unexpected(field, "a list"));
                    };
                    self.repeated(field, elements)?;
                }
            }
        }

        Ok(())
    }

    fn repeated(&mut self, field: &FieldPlan, elements: &[Value]) -> Result<(), RowError> {
        if elements.is_empty() {
            self.nulls(field);
            return Ok(());
        }

        let saved = (
            self.repetition_level,
            self.definition_level,
            self.repeated_depth,
        );
        self.repeated_depth += 1;
        self.definition_level += 1;

        let mut result = Ok(());
        for (index, element) in elements.iter().enumerate() {
            if index > 0 {
                self.repetition_level = self.repeated_depth;
            }
            result = self.present(field, element);
            if result.is_err() {
                break;
            }
        }

        (
            self.repetition_level,
            self.definition_level,
            self.repeated_depth,
        ) = saved;
        result
    }

    /// Emits a value that is known to be present, at the current levels.
    fn present(&mut self, field: &FieldPlan, value: &Value) -> Result<(), RowError> {
        match &field.node {
            FieldNode::Leaf { column, kind } => {
                let value = leaf_value(field, kind, value)?;
                self.values.push(LeveledValue {
                    column: *column,
                    repetition_level: self.repetition_level,
                    definition_level: self.definition_level,
                    value: Some(value),
                });
                Ok(())
            }
            FieldNode::Group(plan) => {
                let Some(nested) = value.as_message() else {
                    return Err(unexpected(field, "a message"));
                };
                self.message(plan, nested)
            }
        }
    }

    fn nulls(&mut self, field: &FieldPlan) {
        for column in field.columns.clone() {
            self.values.push(LeveledValue {
                column,
                repetition_level: self.repetition_level,
                definition_level: self.definition_level,
                value: None,
            });
        }
    }
}

fn leaf_value(field: &FieldPlan, kind: &LeafKind, value: &Value) -> Result<LeafValue, RowError> {
    let leaf = match (kind, value) {
        (LeafKind::Boolean, Value::Bool(v)) => LeafValue::Boolean(*v),
        (LeafKind::Int32, Value::I32(v)) => LeafValue::Int32(*v),
        (LeafKind::Int64, Value::I64(v)) => LeafValue::Int64(*v),
        // Unsigned values keep their bit pattern, the logical type marks them unsigned
        (LeafKind::UInt32, Value::U32(v)) => LeafValue::Int32(*v as i32),
        (LeafKind::UInt64, Value::U64(v)) => LeafValue::Int64(*v as i64),
        (LeafKind::Float, Value::F32(v)) => LeafValue::Float(*v),
        (LeafKind::Double, Value::F64(v)) => LeafValue::Double(*v),
        (LeafKind::String, Value::String(v)) => LeafValue::ByteArray(Bytes::from(v.clone())),
        (LeafKind::Bytes, Value::Bytes(v)) => LeafValue::ByteArray(v.clone()),
        (LeafKind::Enum(descriptor), Value::EnumNumber(number)) => {
            let Some(symbol) = descriptor.get_value(*number) else {
                let known = descriptor
                    .values()
                    .map(|value| format!("{} ({})", value.name(), value.number()))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(RowError::InvalidEnumValue {
                    field: field.descriptor.full_name().to_string(),
                    value: *number,
                    known,
                });
            };
            LeafValue::ByteArray(Bytes::from(symbol.name().to_string()))
        }
        (LeafKind::Timestamp, Value::Message(timestamp)) => {
            LeafValue::Int64(timestamp_nanos(field, timestamp)?)
        }
        (LeafKind::Fixed256(column_type), value) => {
            let converted = match value {
                Value::String(literal) => column_type.parse_literal(literal),
                Value::I32(v) => column_type.from_i64(i64::from(*v)),
                Value::I64(v) => column_type.from_i64(*v),
                Value::U32(v) => column_type.from_u64(u64::from(*v)),
                Value::U64(v) => column_type.from_u64(*v),
                _ => return Err(unexpected(field, "a string or integer")),
            };
            let bytes = converted.map_err(|reason| RowError::ColumnTypeConversion {
                field: field.descriptor.full_name().to_string(),
                column_type: *column_type,
                value: display_value(value),
                reason,
            })?;
            LeafValue::FixedLenByteArray(Bytes::copy_from_slice(&bytes))
        }
        (kind, _) => return Err(unexpected(field, expected_name(kind))),
    };

    Ok(leaf)
}

fn timestamp_nanos(field: &FieldPlan, timestamp: &DynamicMessage) -> Result<i64, RowError> {
    let seconds = timestamp
        .get_field_by_name("seconds")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| unexpected(field, "a timestamp with seconds"))?;
    let nanos = timestamp
        .get_field_by_name("nanos")
        .and_then(|value| value.as_i32())
        .ok_or_else(|| unexpected(field, "a timestamp with nanos"))?;

    seconds
        .checked_mul(1_000_000_000)
        .and_then(|value| value.checked_add(i64::from(nanos)))
        .ok_or_else(|| unexpected(field, "a timestamp within the nanosecond range"))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        other => format!("{other:?}"),
    }
}

fn expected_name(kind: &LeafKind) -> &'static str {
    match kind {
        LeafKind::Boolean => "a bool",
        LeafKind::Int32 => "an int32",
        LeafKind::Int64 => "an int64",
        LeafKind::UInt32 => "a uint32",
        LeafKind::UInt64 => "a uint64",
        LeafKind::Float => "a float",
        LeafKind::Double => "a double",
        LeafKind::String => "a string",
        LeafKind::Bytes => "bytes",
        LeafKind::Enum(_) => "an enum number",
        LeafKind::Timestamp => "a timestamp message",
        LeafKind::Fixed256(_) => "a string or integer",
    }
}

fn unexpected(field: &FieldPlan, expected: &'static str) -> RowError {
    RowError::UnexpectedValue {
        field: field.descriptor.full_name().to_string(),
        expected,
    }
}
