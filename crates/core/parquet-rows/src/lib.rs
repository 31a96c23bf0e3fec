//! Flattening of protobuf messages into leveled Parquet rows.
//!
//! Parquet stores nested and repeated data as flat leaf columns. Each leaf value carries two small
//! integers that let a reader rebuild the original tree:
//!
//! - the *repetition level* tells at which repeated ancestor a new list entry starts (0 means a
//!   new row),
//! - the *definition level* counts how many optional or repeated ancestors are actually present,
//!   a value below the column maximum is a null at that depth.
//!
//! The crate is split in three steps:
//!
//! 1. [`schema`] derives, once at startup, the tables and their flat leaf-column layout from a
//!    message descriptor ([`schema::derive_tables`]).
//! 2. [`encode`] walks one message against that layout and produces a [`Row`].
//! 3. [`file`] buffers rows per column and serializes them into a Parquet file.
//!
//! [`extract`] ties the first two together and turns one decoded block payload into rows for
//! every table.

pub mod column_type;
pub mod encode;
pub mod error;
pub mod extract;
pub mod file;
pub mod row;
pub mod schema;

pub use self::{
    column_type::ColumnType,
    error::{RowError, SchemaError},
    extract::{RowExtractor, RowsByTable},
    file::ParquetFileBuilder,
    row::{LeafValue, LeveledValue, Row},
    schema::{SchemaOptions, TableMode, TableSchema, TableSet, derive_tables},
};
