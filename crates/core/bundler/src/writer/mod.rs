//! Accumulation of the active boundary's content.
//!
//! Every variant implements [`Writer`]. [`MeteredWriter`] and [`DatePartitionedWriter`] wrap
//! another writer and change what its artifacts do, they never accumulate anything themselves.

mod buffered;
mod columnar;
mod date_partitioned;
mod direct;
mod mem;
mod metered;
mod noop;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet_rows::RowsByTable;

pub use self::{
    buffered::BufferedWriter,
    columnar::{ParquetWriter, ParquetWriterOptions},
    date_partitioned::{DatePartitionedUpload, DatePartitionedWriter},
    direct::DirectWriter,
    mem::MemWriter,
    metered::{MeteredUpload, MeteredWriter},
    noop::NoopWriter,
};
use crate::{error::WriterError, range::BlockRange, uploadable::Uploadable};

/// Kind of file produced, which is also its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Jsonl,
    Parquet,
}

impl FileType {
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Jsonl => "jsonl",
            FileType::Parquet => "parquet",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Accumulates the content of one boundary at a time.
///
/// Calls follow `start_boundary`, any number of writes, then `close_boundary` or
/// `discard_boundary`. Anything else is a lifecycle error.
#[async_trait]
pub trait Writer: Send {
    fn file_type(&self) -> FileType;

    /// Opens a boundary, fails if one is already open.
    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError>;

    /// Appends encoded bytes to the open boundary.
    async fn write(&mut self, data: Bytes) -> Result<(), WriterError>;

    /// Appends the rows of one item to the open boundary.
    async fn write_rows(&mut self, _rows: RowsByTable) -> Result<(), WriterError> {
        Err(WriterError::UnsupportedInput {
            file_type: self.file_type(),
            input: "rows",
        })
    }

    /// Finalizes the open boundary as `range` and returns its artifact.
    ///
    /// `range` starts where the boundary was opened and may end before the nominal end when
    /// the boundary closes early.
    async fn close_boundary(&mut self, range: BlockRange)
    -> Result<Box<dyn Uploadable>, WriterError>;

    /// Drops the open boundary and everything written to it.
    async fn discard_boundary(&mut self) -> Result<(), WriterError>;

    /// Timestamp of the last item written, used by date aware decorators.
    fn set_current_timestamp(&mut self, _timestamp: DateTime<Utc>) {}
}

/// Validates a close request against the boundary that is open.
pub(crate) fn check_close(active: BlockRange, requested: BlockRange) -> Result<(), WriterError> {
    if requested.start != active.start || requested.end > active.end || requested.is_empty() {
        return Err(WriterError::RangeMismatch { active, requested });
    }
    Ok(())
}
