//! Errors raised while deriving table schemas and while encoding rows.
//!
//! [`SchemaError`] is a configuration problem detected once, before any block is processed.
//! [`RowError`] rejects a single payload and never touches rows that were already buffered.

use crate::column_type::ColumnType;

/// The message descriptor cannot be turned into a set of Parquet tables.
///
/// Every variant is fatal: the same descriptor would fail the same way on every retry.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A field uses a protobuf kind that has no Parquet leaf mapping.
    ///
    /// Groups (proto2) are the only kind rejected this way.
    #[error("field '{field}' has kind {kind} which is not supported as a parquet column")]
    UnsupportedFieldKind { field: String, kind: String },

    /// Map fields have no flat representation in the derived schema.
    ///
    /// Mark the field as ignored or expose it as a repeated message of key/value entries.
    #[error("field '{field}' is a map field, map fields are not supported")]
    MapField { field: String },

    /// A message references itself, directly or through other messages.
    ///
    /// A Parquet schema has a finite depth so recursive messages cannot be represented.
    #[error("message '{message}' is recursive through field '{field}'")]
    RecursiveMessage { message: String, field: String },

    /// A table would end up without a single leaf column.
    ///
    /// This happens when every field of the table message is ignored or is itself an empty
    /// message.
    #[error("table '{table}' has no column")]
    EmptyTable { table: String },

    /// A column type override was attached to a field it cannot apply to.
    #[error("column type {column_type} cannot be applied to field '{field}' of kind {kind}")]
    InvalidColumnType {
        field: String,
        column_type: ColumnType,
        kind: String,
    },

    /// Row-list mode found no repeated message field to take rows from.
    #[error("message '{message}' has no repeated message field to extract rows from")]
    RowSourceNotFound { message: String },

    /// Row-list mode found more than one repeated message field.
    ///
    /// The row source must be unambiguous, configure explicit tables instead.
    #[error(
        "message '{message}' has {} repeated message fields ({}), expected exactly one",
        fields.len(),
        fields.join(", ")
    )]
    AmbiguousRowSource {
        message: String,
        fields: Vec<String>,
    },

    /// Explicit table names were configured but none of them matched a message of the tree.
    #[error("none of the configured table messages ({}) is reachable from '{message}'", tables.join(", "))]
    NoTableFound {
        message: String,
        tables: Vec<String>,
    },

    /// Two tables resolved to the same name.
    #[error("table name '{table}' is used more than once")]
    DuplicateTable { table: String },

    /// The Parquet schema builder rejected the derived type.
    #[error("invalid parquet type for '{path}'")]
    ParquetType {
        path: String,
        #[source]
        source: parquet::errors::ParquetError,
    },
}

/// A single message could not be converted into rows.
///
/// The whole message is rejected, no partial row is ever produced.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    /// Enum numeric value does not resolve to a declared symbol.
    ///
    /// No default is substituted: the producer emitted a value the descriptor does not know
    /// about, which usually means the descriptor is outdated.
    #[error(
        "enum value {value} is not a valid enumeration value for field '{field}', known enum values are [{known}]"
    )]
    InvalidEnumValue {
        field: String,
        value: i32,
        known: String,
    },

    /// A 256-bit column received a literal it cannot represent.
    ///
    /// Covers malformed decimal/hex strings, negative values for unsigned columns and values
    /// that do not fit in 256 bits.
    #[error("field '{field}' value {value:?} cannot be converted to {column_type}: {reason}")]
    ColumnTypeConversion {
        field: String,
        column_type: ColumnType,
        value: String,
        reason: String,
    },

    /// The dynamic value does not match what the schema expects for this field.
    ///
    /// Indicates a descriptor mismatch between schema derivation and decoding.
    #[error("field '{field}' holds an unexpected value, expected {expected}")]
    UnexpectedValue {
        field: String,
        expected: &'static str,
    },

    /// The payload could not be decoded with the configured message descriptor.
    #[error("failed to decode message '{message}'")]
    Decode {
        message: String,
        #[source]
        source: prost_reflect::prost::DecodeError,
    },

    /// A leaf value does not match the physical type of its column.
    ///
    /// This is a bug in row encoding rather than a data problem.
    #[error("column {column} of table '{table}' expects {expected} values")]
    ColumnMismatch {
        table: String,
        column: usize,
        expected: &'static str,
    },

    /// Serializing buffered rows into Parquet failed.
    #[error("failed to write parquet data for table '{table}'")]
    Parquet {
        table: String,
        #[source]
        source: parquet::errors::ParquetError,
    },
}
