use std::{fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{
    DateTime, Utc,
    format::{Item, StrftimeItems},
};
use object_store::{
    ObjectStore,
    path::{Path, PathPart},
};
use parquet_rows::RowsByTable;

use super::{FileType, Writer};
use crate::{
    error::{UploadError, WriterError},
    range::BlockRange,
    uploadable::{PathMapper, Uploadable},
};

/// Places every artifact under a directory named after the UTC date of the boundary's last
/// item, `0000000100-0000000200.jsonl` becoming `2024-01-31/0000000100-0000000200.jsonl`.
pub struct DatePartitionedWriter {
    inner: Box<dyn Writer>,
    format: String,
    current: Option<DateTime<Utc>>,
}

impl DatePartitionedWriter {
    /// Fails if `format` is not a valid strftime format.
    pub fn new(inner: Box<dyn Writer>, format: impl Into<String>) -> Result<Self, WriterError> {
        let format = format.into();
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(WriterError::InvalidDateFormat { format });
        }

        Ok(Self {
            inner,
            format,
            current: None,
        })
    }

    fn date_directory(&self, timestamp: DateTime<Utc>) -> Option<String> {
        let mut directory = String::new();
        write!(directory, "{}", timestamp.format(&self.format)).ok()?;
        Some(directory)
    }
}

#[async_trait]
impl Writer for DatePartitionedWriter {
    fn file_type(&self) -> FileType {
        self.inner.file_type()
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        self.inner.start_boundary(range).await
    }

    async fn write(&mut self, data: Bytes) -> Result<(), WriterError> {
        self.inner.write(data).await
    }

    async fn write_rows(&mut self, rows: RowsByTable) -> Result<(), WriterError> {
        self.inner.write_rows(rows).await
    }

    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let artifact = self.inner.close_boundary(range).await?;

        let Some(directory) = self.current.and_then(|ts| self.date_directory(ts)) else {
            tracing::warn!(boundary = %range, "no timestamp for date partitioning, using original path");
            return Ok(artifact);
        };

        Ok(Box::new(DatePartitionedUpload {
            inner: artifact,
            directory,
        }))
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        self.inner.discard_boundary().await
    }

    fn set_current_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.current = Some(timestamp);
        self.inner.set_current_timestamp(timestamp);
    }
}

/// Artifact wrapper uploading under a date directory.
#[derive(Debug)]
pub struct DatePartitionedUpload {
    inner: Box<dyn Uploadable>,
    directory: String,
}

impl DatePartitionedUpload {
    pub fn new(inner: Box<dyn Uploadable>, directory: impl Into<String>) -> Self {
        Self {
            inner,
            directory: directory.into(),
        }
    }

    /// Inserts the date directory between the parent directory and the file name.
    fn partitioned(&self, path: &Path) -> Path {
        let mut parts: Vec<PathPart<'_>> = path.parts().collect();
        let file_name = parts.pop();
        parts.extend(
            self.directory
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(PathPart::from),
        );
        parts.extend(file_name);
        Path::from_iter(parts)
    }
}

#[async_trait]
impl Uploadable for DatePartitionedUpload {
    fn paths(&self) -> Vec<Path> {
        self.inner
            .paths()
            .iter()
            .map(|path| self.partitioned(path))
            .collect()
    }

    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let partitioned = |path: &Path| map(&self.partitioned(path));
        let paths = self.inner.upload_mapped(store, &partitioned).await?;

        tracing::debug!(directory = %self.directory, paths = ?paths, "date partitioning applied");
        Ok(paths)
    }

    async fn cleanup(&self) -> Result<(), UploadError> {
        self.inner.cleanup().await
    }
}
