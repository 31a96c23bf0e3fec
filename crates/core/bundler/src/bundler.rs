use std::{fmt, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use parquet_rows::RowsByTable;

use crate::{
    error::BundlerError,
    range::BlockRange,
    state::{ActiveBoundary, BlockRef, Checkpoint},
    uploadable::Uploadable,
    writer::{FileType, Writer},
};

/// Position of one item in the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub cursor: String,
    pub block: BlockRef,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A closed boundary on its way to the output store.
pub struct UploadTask {
    pub range: BlockRange,
    pub artifact: Box<dyn Uploadable>,
    /// Persisted once `artifact` is uploaded.
    pub checkpoint: Checkpoint,
}

impl fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadTask")
            .field("range", &self.range)
            .field("artifact", &self.artifact)
            .finish_non_exhaustive()
    }
}

struct Active {
    range: BlockRange,
    started: Instant,
    items: u64,
}

#[derive(Debug, Default)]
struct BoundaryStats {
    count: u64,
    total_secs: f64,
}

/// Windows a block stream into fixed-size boundaries.
///
/// The bundler owns the single active boundary and decides when it closes: when a block lands
/// past its end, when the UTC date of the items changes (with date closure enabled), or when
/// the stream finishes. Every close yields an [`UploadTask`] for the caller to enqueue. Calls
/// must be serialized by the caller, item data is written after [`Bundler::advance`] accepted
/// the item.
pub struct Bundler {
    window: u64,
    writer: Box<dyn Writer>,
    date_closure: bool,
    active: Option<Active>,
    last_processed: Option<u64>,
    latest: Option<Progress>,
    current_date: Option<NaiveDate>,
    stats: BoundaryStats,
}

impl Bundler {
    /// Creates a bundler closing boundaries every `window` blocks.
    ///
    /// With `date_closure`, a boundary also closes early when the UTC date of its items changes.
    pub fn new(
        window: u64,
        writer: Box<dyn Writer>,
        date_closure: bool,
    ) -> Result<Self, BundlerError> {
        if window == 0 {
            return Err(BundlerError::InvalidWindowSize);
        }

        Ok(Self {
            window,
            writer,
            date_closure,
            active: None,
            last_processed: None,
            latest: None,
            current_date: None,
            stats: BoundaryStats::default(),
        })
    }

    /// Seeds the cursor bookkeeping with the position loaded from the state file.
    ///
    /// Boundaries closed before the first item arrives then carry that position.
    pub fn resume_from(&mut self, progress: Progress) {
        self.last_processed = Some(progress.block.number);
        self.latest = Some(progress);
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn file_type(&self) -> FileType {
        self.writer.file_type()
    }

    pub fn active_range(&self) -> Option<BlockRange> {
        self.active.as_ref().map(|active| active.range)
    }

    /// Descriptor of the active boundary as it appears in the state file.
    pub fn active_boundary(&self) -> Option<ActiveBoundary> {
        self.active_range().map(|range| self.descriptor(range))
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    /// Position of the last item accepted by [`Bundler::advance`].
    pub fn latest(&self) -> Option<&Progress> {
        self.latest.as_ref()
    }

    /// Opens the window containing `block`, from `block` up to the next multiple of the window.
    pub async fn start(&mut self, block: u64) -> Result<(), BundlerError> {
        if let Some(active) = &self.active {
            return Err(BundlerError::AlreadyStarted {
                active: active.range,
            });
        }

        let range = self.window_at(block)?;
        self.writer.start_boundary(range).await?;
        self.active = Some(Active {
            range,
            started: Instant::now(),
            items: 0,
        });

        tracing::debug!(boundary = %range, "boundary started");
        Ok(())
    }

    /// Accepts the next item, closing every boundary the item moves past.
    ///
    /// Returns the boundaries closed on the way, in block order. On success the item belongs to
    /// the active boundary and its data may be written.
    pub async fn advance(&mut self, progress: Progress) -> Result<Vec<UploadTask>, BundlerError> {
        let block = progress.block.number;
        let active = self.active.as_ref().ok_or(BundlerError::NotStarted)?.range;

        let expected = self
            .last_processed
            .map_or(active.start, |last| last.max(active.start));
        if block < expected {
            return Err(BundlerError::BlockOutOfOrder { block, expected });
        }

        let mut tasks = Vec::new();

        if self.date_closure
            && let Some(timestamp) = progress.timestamp
        {
            let date = timestamp.date_naive();
            if let (Some(current), Some(last)) = (self.current_date, self.last_processed)
                && current != date
                && block > last
                && active.contains(last)
            {
                tracing::info!(
                    boundary = %active,
                    last_processed = last,
                    from = %current,
                    to = %date,
                    "date changed, closing boundary early"
                );
                tasks.push(self.close(BlockRange::new(active.start, last + 1)).await?);
                self.start(last + 1).await?;
            }
            self.current_date = Some(date);
        }

        let mut skipped = 0u64;
        while let Some(range) = self.active_range()
            && block >= range.end
        {
            tasks.push(self.close(range).await?);
            self.start(range.end).await?;
            skipped += 1;
        }
        if skipped > 1 {
            tracing::debug!(block, skipped = skipped - 1, "skipped ahead over empty boundaries");
        }

        if let Some(timestamp) = progress.timestamp {
            self.writer.set_current_timestamp(timestamp);
        }
        if let Some(active) = &mut self.active {
            active.items += 1;
        }
        self.last_processed = Some(block);
        self.latest = Some(progress);

        Ok(tasks)
    }

    /// Appends encoded bytes of the current item to the active boundary.
    pub async fn write(&mut self, data: Bytes) -> Result<(), BundlerError> {
        if self.active.is_none() {
            return Err(BundlerError::NotStarted);
        }
        self.writer.write(data).await.map_err(Into::into)
    }

    /// Appends the rows of the current item to the active boundary.
    pub async fn write_rows(&mut self, rows: RowsByTable) -> Result<(), BundlerError> {
        if self.active.is_none() {
            return Err(BundlerError::NotStarted);
        }
        self.writer.write_rows(rows).await.map_err(Into::into)
    }

    /// Closes the active boundary at the last processed block, the stream being over.
    ///
    /// A boundary holding no item is discarded instead, it would only repeat the previous
    /// checkpoint.
    pub async fn finish(&mut self) -> Result<Option<UploadTask>, BundlerError> {
        let Some(range) = self.active_range() else {
            return Ok(None);
        };

        match self.last_processed.filter(|last| range.contains(*last)) {
            Some(last) => self
                .close(BlockRange::new(range.start, last + 1))
                .await
                .map(Some),
            None => {
                self.discard().await?;
                Ok(None)
            }
        }
    }

    /// Drops the active boundary and its content.
    pub async fn discard(&mut self) -> Result<(), BundlerError> {
        let active = self.active.take().ok_or(BundlerError::NotStarted)?;
        self.writer.discard_boundary().await?;

        tracing::info!(boundary = %active.range, items = active.items, "boundary discarded");
        Ok(())
    }

    fn window_at(&self, block: u64) -> Result<BlockRange, BundlerError> {
        BlockRange::window(block, self.window).ok_or(BundlerError::WindowOverflow {
            block,
            size: self.window,
        })
    }

    async fn close(&mut self, range: BlockRange) -> Result<UploadTask, BundlerError> {
        let next = self.window_at(range.end)?;
        let active = self.active.take().ok_or(BundlerError::NotStarted)?;
        let artifact = self.writer.close_boundary(range).await?;

        let (cursor, block) = match &self.latest {
            Some(progress) => (progress.cursor.clone(), progress.block.clone()),
            None => (String::new(), BlockRef::default()),
        };
        let checkpoint = Checkpoint {
            cursor,
            block,
            closed: range,
            next: self.descriptor(next),
        };

        let elapsed = active.started.elapsed();
        self.stats.count += 1;
        self.stats.total_secs += elapsed.as_secs_f64();
        tracing::info!(
            boundary = %range,
            items = active.items,
            duration = ?elapsed,
            avg_duration_secs = self.stats.total_secs / self.stats.count as f64,
            boundary_count = self.stats.count,
            "boundary closed"
        );

        Ok(UploadTask {
            range,
            artifact,
            checkpoint,
        })
    }

    fn descriptor(&self, range: BlockRange) -> ActiveBoundary {
        ActiveBoundary {
            start: range.start,
            end: range.end,
            working_filename: range.working_file_name(self.writer.file_type().extension()),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use object_store::path::Path;

    use super::*;
    use crate::writer::MemWriter;

    fn progress(block: u64) -> Progress {
        Progress {
            cursor: format!("cursor-{block}"),
            block: BlockRef {
                id: format!("0x{block:x}"),
                number: block,
            },
            timestamp: None,
        }
    }

    fn progress_at(block: u64, day: u32, hour: u32) -> Progress {
        Progress {
            timestamp: Some(
                Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0)
                    .single()
                    .expect("valid date"),
            ),
            ..progress(block)
        }
    }

    fn bundler(window: u64, date_closure: bool) -> Bundler {
        Bundler::new(window, Box::new(MemWriter::new(FileType::Jsonl)), date_closure)
            .expect("valid window")
    }

    fn ranges(tasks: &[UploadTask]) -> Vec<(u64, u64)> {
        tasks.iter().map(|t| (t.range.start, t.range.end)).collect()
    }

    #[tokio::test]
    async fn skip_ahead_closes_every_intervening_boundary() {
        //* Given
        let mut bundler = bundler(100, false);
        bundler.start(4).await.expect("start");

        //* When
        let tasks = bundler.advance(progress(763)).await.expect("advance");

        //* Then
        assert_eq!(
            ranges(&tasks),
            [
                (4, 100),
                (100, 200),
                (200, 300),
                (300, 400),
                (400, 500),
                (500, 600),
                (600, 700)
            ]
        );
        assert_eq!(bundler.active_range(), Some(BlockRange::new(700, 800)));
        assert!(tasks.windows(2).all(|w| w[0].range.end == w[1].range.start));
    }

    #[tokio::test]
    async fn checkpoints_carry_the_cursor_before_the_jump() {
        //* Given
        let mut bundler = bundler(10, false);
        bundler.start(0).await.expect("start");
        bundler.advance(progress(3)).await.expect("advance");

        //* When
        let tasks = bundler.advance(progress(25)).await.expect("advance");

        //* Then
        assert_eq!(ranges(&tasks), [(0, 10), (10, 20)]);
        for task in &tasks {
            assert_eq!(task.checkpoint.cursor, "cursor-3");
            assert_eq!(task.checkpoint.block.number, 3);
            assert_eq!(task.checkpoint.next.start, task.range.end);
        }
        assert_eq!(
            tasks[1].checkpoint.next,
            ActiveBoundary {
                start: 20,
                end: 30,
                working_filename: "0000000020-0000000030.tmp.jsonl".to_string(),
            }
        );
        assert_eq!(bundler.latest().map(|p| p.cursor.as_str()), Some("cursor-25"));
    }

    #[tokio::test]
    async fn closed_boundaries_partition_the_processed_blocks() {
        //* Given
        let mut bundler = bundler(7, false);
        bundler.start(3).await.expect("start");
        let blocks = [3u64, 4, 9, 10, 11, 30, 31, 50, 51, 52, 70];

        //* When
        let mut closed = Vec::new();
        for block in blocks {
            closed.extend(bundler.advance(progress(block)).await.expect("advance"));
        }
        closed.extend(bundler.finish().await.expect("finish"));

        //* Then
        assert_eq!(closed.first().map(|t| t.range.start), Some(3));
        assert_eq!(closed.last().map(|t| t.range.end), Some(71));
        for pair in closed.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
        }
        for task in &closed[..closed.len() - 1] {
            assert!(task.range.len() <= 7);
            assert_eq!(task.range.end % 7, 0);
        }
    }

    #[tokio::test]
    async fn date_change_closes_at_last_processed_block() {
        //* Given
        let mut bundler = bundler(100, true);
        bundler.start(0).await.expect("start");
        bundler.advance(progress_at(10, 1, 22)).await.expect("advance");
        bundler.advance(progress_at(42, 1, 23)).await.expect("advance");

        //* When
        let tasks = bundler.advance(progress_at(57, 2, 0)).await.expect("advance");

        //* Then
        assert_eq!(ranges(&tasks), [(0, 43)]);
        assert_eq!(tasks[0].checkpoint.cursor, "cursor-42");
        assert_eq!(bundler.active_range(), Some(BlockRange::new(43, 100)));
    }

    #[tokio::test]
    async fn date_change_followed_by_skip_ahead() {
        //* Given
        let mut bundler = bundler(100, true);
        bundler.start(0).await.expect("start");
        bundler.advance(progress_at(90, 1, 23)).await.expect("advance");

        //* When
        let tasks = bundler.advance(progress_at(250, 2, 1)).await.expect("advance");

        //* Then
        assert_eq!(ranges(&tasks), [(0, 91), (91, 100), (100, 200)]);
        assert_eq!(bundler.active_range(), Some(BlockRange::new(200, 300)));
    }

    #[tokio::test]
    async fn date_partitioned_artifact_uses_last_item_date() {
        //* Given
        let writer = crate::writer::DatePartitionedWriter::new(
            Box::new(MemWriter::new(FileType::Jsonl)),
            "%Y-%m-%d",
        )
        .expect("valid format");
        let mut bundler = Bundler::new(100, Box::new(writer), true).expect("valid window");
        bundler.start(0).await.expect("start");
        bundler.advance(progress_at(5, 1, 12)).await.expect("advance");
        bundler.write(Bytes::from_static(b"{}\n")).await.expect("write");

        //* When
        let tasks = bundler.advance(progress_at(6, 2, 12)).await.expect("advance");

        //* Then
        assert_eq!(
            tasks[0].artifact.paths(),
            [Path::from("2024-03-01/0000000000-0000000006.jsonl")]
        );
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let mut bundler = bundler(10, false);

        assert!(matches!(
            bundler.advance(progress(1)).await,
            Err(BundlerError::NotStarted)
        ));

        bundler.start(0).await.expect("start");
        assert!(matches!(
            bundler.start(0).await,
            Err(BundlerError::AlreadyStarted { .. })
        ));

        bundler.advance(progress(5)).await.expect("advance");
        assert!(matches!(
            bundler.advance(progress(4)).await,
            Err(BundlerError::BlockOutOfOrder {
                block: 4,
                expected: 5
            })
        ));

        assert!(matches!(
            Bundler::new(0, Box::new(MemWriter::new(FileType::Jsonl)), false),
            Err(BundlerError::InvalidWindowSize)
        ));
    }

    #[tokio::test]
    async fn windows_ending_past_u64_max_are_rejected() {
        //* Given
        let mut bundler = bundler(100, false);

        //* When
        let result = bundler.start(u64::MAX - 5).await;

        //* Then
        let err = result.expect_err("window overflows");
        assert!(matches!(
            err,
            BundlerError::WindowOverflow {
                block,
                size: 100
            } if block == u64::MAX - 5
        ));
        assert_eq!(bundler.active_range(), None);

        //* Given
        let last = u64::MAX - u64::MAX % 100;
        bundler.start(last - 10).await.expect("last window fits");
        bundler.advance(progress(last - 1)).await.expect("advance");

        //* When
        let result = bundler.advance(progress(last)).await;

        //* Then
        assert!(matches!(result, Err(BundlerError::WindowOverflow { .. })));
        assert_eq!(bundler.active_range(), Some(BlockRange::new(last - 10, last)));
    }

    #[tokio::test]
    async fn finish_closes_at_last_processed_or_discards_empty() {
        //* Given
        let mut bundler = bundler(100, false);
        bundler.start(0).await.expect("start");
        bundler.advance(progress(41)).await.expect("advance");

        //* When
        let task = bundler.finish().await.expect("finish");

        //* Then
        let task = task.expect("boundary with items is closed");
        assert_eq!(task.range, BlockRange::new(0, 42));
        assert_eq!(task.checkpoint.next.start, 42);
        assert_eq!(bundler.active_range(), None);

        //* Given
        let mut empty = self::bundler(100, false);
        empty.start(0).await.expect("start");
        empty.advance(progress(99)).await.expect("advance");
        empty.advance(progress(100)).await.expect("advance");
        empty.discard().await.expect("discard");
        empty.start(200).await.expect("start");

        //* Then
        assert!(empty.finish().await.expect("finish").is_none());
    }

    #[tokio::test]
    async fn resumed_bundler_checkpoints_stored_cursor_until_first_item() {
        //* Given
        let mut bundler = bundler(10, false);
        bundler.resume_from(progress(19));
        bundler.start(20).await.expect("start");

        //* When
        let tasks = bundler.advance(progress(35)).await.expect("advance");

        //* Then
        assert_eq!(ranges(&tasks), [(20, 30)]);
        assert_eq!(tasks[0].checkpoint.cursor, "cursor-19");
    }
}
