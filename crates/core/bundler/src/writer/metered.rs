use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::{ObjectStore, path::Path};
use parquet_rows::RowsByTable;

use super::{FileType, Writer};
use crate::{
    error::{UploadError, WriterError},
    range::BlockRange,
    uploadable::{PathMapper, Uploadable},
};

/// Running totals of a duration series.
#[derive(Debug, Default, Clone, Copy)]
struct DurationStats {
    count: u64,
    total: Duration,
    last: Duration,
}

impl DurationStats {
    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.last = duration;
    }

    fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

#[derive(Debug, Default)]
struct WriterStats {
    creation: DurationStats,
    upload: DurationStats,
    files: u64,
}

/// Measures how long boundaries take to build and to upload, and logs it.
pub struct MeteredWriter {
    inner: Box<dyn Writer>,
    stats: Arc<Mutex<WriterStats>>,
    boundary: Option<(BlockRange, Instant)>,
    bytes: u64,
    rows: u64,
}

impl MeteredWriter {
    pub fn new(inner: Box<dyn Writer>) -> Self {
        Self {
            inner,
            stats: Default::default(),
            boundary: None,
            bytes: 0,
            rows: 0,
        }
    }
}

#[async_trait]
impl Writer for MeteredWriter {
    fn file_type(&self) -> FileType {
        self.inner.file_type()
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        self.inner.start_boundary(range).await?;
        self.boundary = Some((range, Instant::now()));
        self.bytes = 0;
        self.rows = 0;
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<(), WriterError> {
        let size = data.len() as u64;
        self.inner.write(data).await?;
        self.bytes += size;
        Ok(())
    }

    async fn write_rows(&mut self, rows: RowsByTable) -> Result<(), WriterError> {
        let count: usize = rows.values().map(Vec::len).sum();
        self.inner.write_rows(rows).await?;
        self.rows += count as u64;
        Ok(())
    }

    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let artifact = self.inner.close_boundary(range).await?;

        let elapsed = self
            .boundary
            .take()
            .map(|(_, started)| started.elapsed())
            .unwrap_or_default();
        let snapshot = {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.creation.record(elapsed);
            stats.files += 1;
            stats.creation
        };

        tracing::info!(
            boundary = %range,
            bytes = self.bytes,
            rows = self.rows,
            last_creation = ?snapshot.last,
            avg_creation = ?snapshot.average(),
            file_count = snapshot.count,
            "boundary created"
        );

        Ok(Box::new(MeteredUpload {
            inner: artifact,
            range,
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        self.boundary = None;
        self.inner.discard_boundary().await
    }

    fn set_current_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.inner.set_current_timestamp(timestamp);
    }
}

/// Artifact wrapper recording upload durations.
pub struct MeteredUpload {
    inner: Box<dyn Uploadable>,
    range: BlockRange,
    stats: Arc<Mutex<WriterStats>>,
}

impl fmt::Debug for MeteredUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteredUpload")
            .field("inner", &self.inner)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Uploadable for MeteredUpload {
    fn paths(&self) -> Vec<Path> {
        self.inner.paths()
    }

    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let started = Instant::now();
        let paths = self.inner.upload_mapped(store, map).await?;
        let elapsed = started.elapsed();

        let (upload, files) = {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.upload.record(elapsed);
            (stats.upload, stats.files)
        };

        tracing::info!(
            boundary = %self.range,
            last_upload = ?upload.last,
            avg_upload = ?upload.average(),
            total_upload = ?upload.total,
            file_count = files,
            "boundary uploaded"
        );

        Ok(paths)
    }

    async fn cleanup(&self) -> Result<(), UploadError> {
        self.inner.cleanup().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::writer::MemWriter;

    #[test]
    fn average_of_recorded_durations() {
        let mut stats = DurationStats::default();
        assert_eq!(stats.average(), Duration::ZERO);

        stats.record(Duration::from_millis(100));
        stats.record(Duration::from_millis(300));

        assert_eq!(stats.average(), Duration::from_millis(200));
        assert_eq!(stats.last, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn forwards_to_inner_writer() {
        //* Given
        let mut writer = MeteredWriter::new(Box::new(MemWriter::new(FileType::Jsonl)));
        let range = BlockRange::new(0, 10);

        //* When
        writer.start_boundary(range).await.expect("start");
        writer.write(Bytes::from_static(b"abc")).await.expect("write");
        let artifact = writer.close_boundary(range).await.expect("close");

        //* Then
        assert_eq!(writer.bytes, 3);
        assert_eq!(artifact.paths(), [Path::from("0000000000-0000000010.jsonl")]);
        let stats = writer.stats.lock().unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.creation.count, 1);
    }
}
