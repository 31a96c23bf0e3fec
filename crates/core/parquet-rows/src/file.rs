//! In-memory Parquet file assembly from leveled rows.

use std::sync::Arc;

use bytes::Bytes;
use parquet::{
    basic::Type as PhysicalType,
    column::writer::ColumnWriter,
    data_type::{ByteArray, FixedLenByteArray},
    errors::ParquetError,
    file::{
        properties::{WriterProperties, WriterPropertiesPtr},
        writer::SerializedFileWriter,
    },
    schema::types::SchemaDescriptor,
};

use crate::{
    error::RowError,
    row::{LeafValue, Row},
    schema::TableSchema,
};

/// Buffers the rows of one table and serializes them into a single Parquet file.
///
/// Rows are kept per column until `max_row_group_rows` is reached, then written out as a row
/// group. The encoded file stays in memory until [`ParquetFileBuilder::finish`].
pub struct ParquetFileBuilder {
    table: String,
    schema: Arc<SchemaDescriptor>,
    writer: SerializedFileWriter<Vec<u8>>,
    columns: Vec<ColumnBuffer>,
    max_row_group_rows: usize,
    buffered_rows: usize,
    total_rows: usize,
}

impl ParquetFileBuilder {
    pub fn new(
        table: &TableSchema,
        properties: WriterPropertiesPtr,
        max_row_group_rows: usize,
    ) -> Result<Self, RowError> {
        let writer = SerializedFileWriter::new(Vec::new(), table.root_type(), properties)
            .map_err(|source| parquet_error(table.name(), source))?;
        let schema = table.parquet_schema().clone();
        let columns = schema
            .columns()
            .iter()
            .map(|column| ColumnBuffer::new(column.physical_type()))
            .collect();

        Ok(Self {
            table: table.name().to_string(),
            schema,
            writer,
            columns,
            max_row_group_rows: max_row_group_rows.max(1),
            buffered_rows: 0,
            total_rows: 0,
        })
    }

    /// Same as [`ParquetFileBuilder::new`] with default writer properties.
    pub fn with_defaults(table: &TableSchema) -> Result<Self, RowError> {
        Self::new(
            table,
            Arc::new(WriterProperties::builder().build()),
            1_000_000,
        )
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Rows pushed so far, flushed or not.
    pub fn num_rows(&self) -> usize {
        self.total_rows
    }

    /// Appends one row.
    ///
    /// The row is checked against the column types before anything is buffered, a rejected row
    /// leaves the builder untouched.
    pub fn push(&mut self, row: Row) -> Result<(), RowError> {
        for value in row.values() {
            let Some(buffer) = self.columns.get(value.column) else {
                return Err(RowError::ColumnMismatch {
                    table: self.table.clone(),
                    column: value.column,
                    expected: "an existing column",
                });
            };
            if let Some(leaf) = &value.value
                && !buffer.accepts(leaf)
            {
                return Err(RowError::ColumnMismatch {
                    table: self.table.clone(),
                    column: value.column,
                    expected: buffer.values.physical_name(),
                });
            }
        }

        for value in row.into_values() {
            let buffer = &mut self.columns[value.column];
            buffer.definition_levels.push(value.definition_level);
            buffer.repetition_levels.push(value.repetition_level);
            if let Some(leaf) = value.value {
                buffer.values.push(leaf);
            }
        }

        self.buffered_rows += 1;
        self.total_rows += 1;

        if self.buffered_rows >= self.max_row_group_rows {
            self.flush_row_group()?;
        }

        Ok(())
    }

    /// Writes the buffered rows as a row group.
    pub fn flush_row_group(&mut self) -> Result<(), RowError> {
        if self.buffered_rows == 0 {
            return Ok(());
        }

        let table = &self.table;
        let mut row_group = self
            .writer
            .next_row_group()
            .map_err(|source| parquet_error(table, source))?;

        let mut index = 0;
        while let Some(mut column) = row_group
            .next_column()
            .map_err(|source| parquet_error(table, source))?
        {
            let descriptor = self.schema.column(index);
            let buffer = &mut self.columns[index];
            let defs = (descriptor.max_def_level() > 0).then_some(&buffer.definition_levels[..]);
            let reps = (descriptor.max_rep_level() > 0).then_some(&buffer.repetition_levels[..]);

            let written = match (column.untyped(), &buffer.values) {
                (ColumnWriter::BoolColumnWriter(w), ColumnValues::Boolean(v)) => {
                    w.write_batch(v, defs, reps)
                }
                (ColumnWriter::Int32ColumnWriter(w), ColumnValues::Int32(v)) => {
                    w.write_batch(v, defs, reps)
                }
                (ColumnWriter::Int64ColumnWriter(w), ColumnValues::Int64(v)) => {
                    w.write_batch(v, defs, reps)
                }
                (ColumnWriter::FloatColumnWriter(w), ColumnValues::Float(v)) => {
                    w.write_batch(v, defs, reps)
                }
                (ColumnWriter::DoubleColumnWriter(w), ColumnValues::Double(v)) => {
                    w.write_batch(v, defs, reps)
                }
                (ColumnWriter::ByteArrayColumnWriter(w), ColumnValues::ByteArray(v)) => {
                    w.write_batch(v, defs, reps)
                }
                (
                    ColumnWriter::FixedLenByteArrayColumnWriter(w),
                    ColumnValues::FixedLenByteArray(v),
                ) => w.write_batch(v, defs, reps),
                (_, values) => {
                    return Err(RowError::ColumnMismatch {
                        table: table.clone(),
                        column: index,
                        expected: values.physical_name(),
                    });
                }
            };
            written.map_err(|source| parquet_error(table, source))?;
            column
                .close()
                .map_err(|source| parquet_error(table, source))?;

            buffer.clear();
            index += 1;
        }

        row_group
            .close()
            .map_err(|source| parquet_error(table, source))?;

        tracing::trace!(table = %self.table, rows = self.buffered_rows, "flushed row group");
        self.buffered_rows = 0;

        Ok(())
    }

    /// Flushes what is left and returns the complete file.
    pub fn finish(mut self) -> Result<Bytes, RowError> {
        self.flush_row_group()?;
        self.writer
            .finish()
            .map_err(|source| parquet_error(&self.table, source))?;

        Ok(Bytes::from(std::mem::take(self.writer.inner_mut())))
    }
}

struct ColumnBuffer {
    definition_levels: Vec<i16>,
    repetition_levels: Vec<i16>,
    values: ColumnValues,
}

impl ColumnBuffer {
    fn new(physical_type: PhysicalType) -> Self {
        let values = match physical_type {
            PhysicalType::BOOLEAN => ColumnValues::Boolean(Vec::new()),
            PhysicalType::INT32 => ColumnValues::Int32(Vec::new()),
            PhysicalType::INT64 | PhysicalType::INT96 => ColumnValues::Int64(Vec::new()),
            PhysicalType::FLOAT => ColumnValues::Float(Vec::new()),
            PhysicalType::DOUBLE => ColumnValues::Double(Vec::new()),
            PhysicalType::BYTE_ARRAY => ColumnValues::ByteArray(Vec::new()),
            PhysicalType::FIXED_LEN_BYTE_ARRAY => ColumnValues::FixedLenByteArray(Vec::new()),
        };

        Self {
            definition_levels: Vec::new(),
            repetition_levels: Vec::new(),
            values,
        }
    }

    fn accepts(&self, value: &LeafValue) -> bool {
        matches!(
            (&self.values, value),
            (ColumnValues::Boolean(_), LeafValue::Boolean(_))
                | (ColumnValues::Int32(_), LeafValue::Int32(_))
                | (ColumnValues::Int64(_), LeafValue::Int64(_))
                | (ColumnValues::Float(_), LeafValue::Float(_))
                | (ColumnValues::Double(_), LeafValue::Double(_))
                | (ColumnValues::ByteArray(_), LeafValue::ByteArray(_))
                | (
                    ColumnValues::FixedLenByteArray(_),
                    LeafValue::FixedLenByteArray(_)
                )
        )
    }

    fn clear(&mut self) {
        self.definition_levels.clear();
        self.repetition_levels.clear();
        self.values.clear();
    }
}

enum ColumnValues {
    Boolean(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    ByteArray(Vec<ByteArray>),
    FixedLenByteArray(Vec<FixedLenByteArray>),
}

impl ColumnValues {
    /// Only called after [`ColumnBuffer::accepts`], other combinations are dropped.
    fn push(&mut self, value: LeafValue) {
        match (self, value) {
            (ColumnValues::Boolean(v), LeafValue::Boolean(x)) => v.push(x),
            (ColumnValues::Int32(v), LeafValue::Int32(x)) => v.push(x),
            (ColumnValues::Int64(v), LeafValue::Int64(x)) => v.push(x),
            (ColumnValues::Float(v), LeafValue::Float(x)) => v.push(x),
            (ColumnValues::Double(v), LeafValue::Double(x)) => v.push(x),
            (ColumnValues::ByteArray(v), LeafValue::ByteArray(x)) => v.push(ByteArray::from(x)),
            (ColumnValues::FixedLenByteArray(v), LeafValue::FixedLenByteArray(x)) => {
                v.push(FixedLenByteArray::from(ByteArray::from(x)))
            }
            _ => {}
        }
    }

    fn clear(&mut self) {
        match self {
            ColumnValues::Boolean(v) => v.clear(),
            ColumnValues::Int32(v) => v.clear(),
            ColumnValues::Int64(v) => v.clear(),
            ColumnValues::Float(v) => v.clear(),
            ColumnValues::Double(v) => v.clear(),
            ColumnValues::ByteArray(v) => v.clear(),
            ColumnValues::FixedLenByteArray(v) => v.clear(),
        }
    }

    fn physical_name(&self) -> &'static str {
        match self {
            ColumnValues::Boolean(_) => "BOOLEAN",
            ColumnValues::Int32(_) => "INT32",
            ColumnValues::Int64(_) => "INT64",
            ColumnValues::Float(_) => "FLOAT",
            ColumnValues::Double(_) => "DOUBLE",
            ColumnValues::ByteArray(_) => "BYTE_ARRAY",
            ColumnValues::FixedLenByteArray(_) => "FIXED_LEN_BYTE_ARRAY",
        }
    }
}

fn parquet_error(table: &str, source: ParquetError) -> RowError {
    RowError::Parquet {
        table: table.to_string(),
        source,
    }
}
