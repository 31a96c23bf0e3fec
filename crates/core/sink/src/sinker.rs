//! The run loop tying a block source to the bundler and the upload queue.

use bundler::{Bundler, BundlerError, ErrorKind, PersistedState, Progress, UploadQueue};
use futures::StreamExt as _;
use monitoring::logging;
use tokio_util::sync::CancellationToken;

use crate::{
    encoder::{Encoded, Encoder},
    error::SinkError,
    source::{BlockScopedData, Source, SourceEvent, StreamRequest},
};

/// Counters of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    /// Blocks accepted by the bundler, rejected payloads included.
    pub blocks: u64,
    /// Payloads that could not be encoded and were left out of the output.
    pub rejected: u64,
    /// Reorganization signals received and ignored.
    pub undo_signals: u64,
    /// Boundaries handed to the upload queue.
    pub boundaries: u64,
}

/// Why the source loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The source stream ended.
    Ended,
    /// A block at or past the stop block arrived.
    Stopped,
    Cancelled,
}

/// Drives one sink run: consumes the source, feeds the bundler and enqueues closed boundaries.
pub struct Sinker {
    bundler: Bundler,
    queue: UploadQueue,
    encoder: Box<dyn Encoder>,
    resume: Option<PersistedState>,
    start_block: u64,
    stop_block: Option<u64>,
    summary: SinkSummary,
}

impl Sinker {
    /// `resume` is the state loaded from the state file, it takes precedence over
    /// `start_block`.
    pub fn new(
        bundler: Bundler,
        queue: UploadQueue,
        encoder: Box<dyn Encoder>,
        resume: Option<PersistedState>,
        start_block: u64,
        stop_block: Option<u64>,
    ) -> Self {
        Self {
            bundler,
            queue,
            encoder,
            resume,
            start_block,
            stop_block,
            summary: SinkSummary::default(),
        }
    }

    /// Runs until the source ends, the stop block is reached, `cancel` fires or an error occurs.
    ///
    /// On a clean end the partial last boundary is closed and uploaded. On cancellation or
    /// error it is discarded, the next run restarts it from the saved state. In every case the
    /// boundaries already closed are drained before returning.
    pub async fn run(
        mut self,
        source: &dyn Source,
        cancel: CancellationToken,
    ) -> Result<SinkSummary, SinkError> {
        let outcome = self.consume(source, &cancel).await;

        let closing = match outcome {
            Ok(Exit::Ended | Exit::Stopped) => self.flush().await,
            Ok(Exit::Cancelled) | Err(_) => {
                self.abandon().await;
                Ok(())
            }
        };
        let result = outcome.and_then(|exit| closing.map(|()| exit));

        let Self { queue, summary, .. } = self;
        let shutdown = queue.shutdown().await;

        match (result, shutdown) {
            (Ok(exit), Ok(())) => {
                tracing::info!(
                    blocks = summary.blocks,
                    rejected = summary.rejected,
                    undo_signals = summary.undo_signals,
                    boundaries = summary.boundaries,
                    cancelled = exit == Exit::Cancelled,
                    "sink run finished"
                );
                Ok(summary)
            }
            // The queue refused a task because an upload failed, report that failure.
            (Err(SinkError::Bundler(BundlerError::QueueClosed)), Err(err)) | (Ok(_), Err(err)) => {
                Err(err.into())
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(shutdown)) => {
                tracing::warn!(
                    error = %shutdown,
                    error_source = logging::error_source(&shutdown),
                    "upload queue did not shut down cleanly"
                );
                Err(err)
            }
        }
    }

    async fn consume(
        &mut self,
        source: &dyn Source,
        cancel: &CancellationToken,
    ) -> Result<Exit, SinkError> {
        let request = self.prepare().await?;
        let mut stream = source.stream(request);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("sink cancelled");
                    return Ok(Exit::Cancelled);
                }
                _ = self.queue.failed() => return Err(BundlerError::QueueClosed.into()),
                event = stream.next() => event,
            };

            let Some(event) = event else {
                tracing::info!(last_block = ?self.bundler.last_processed(), "source stream ended");
                return Ok(Exit::Ended);
            };

            match event? {
                SourceEvent::Data(data) => {
                    if let Some(stop) = self.stop_block
                        && data.clock.number >= stop
                    {
                        tracing::info!(stop_block = stop, "stop block reached");
                        return Ok(Exit::Stopped);
                    }
                    self.handle(data).await?;
                }
                SourceEvent::Undo {
                    last_valid_block,
                    last_valid_cursor,
                } => {
                    self.summary.undo_signals += 1;
                    tracing::warn!(
                        last_valid_block = last_valid_block.number,
                        last_valid_cursor = %last_valid_cursor,
                        "undo signal ignored, only final blocks are expected"
                    );
                }
            }
        }
    }

    /// Opens the first boundary and builds the source request.
    async fn prepare(&mut self) -> Result<StreamRequest, SinkError> {
        let Some(state) = self.resume.take() else {
            self.bundler.start(self.start_block).await?;
            tracing::info!(start_block = self.start_block, "starting without saved state");
            return Ok(StreamRequest {
                cursor: None,
                start_block: self.start_block,
                stop_block: self.stop_block,
            });
        };

        let resume_block = state.resume_block();
        let cursor = (!state.cursor.is_empty()).then(|| state.cursor.clone());
        if let Some(cursor) = &cursor {
            self.bundler.resume_from(Progress {
                cursor: cursor.clone(),
                block: state.block.clone(),
                timestamp: None,
            });
        }
        self.bundler.start(resume_block).await?;

        tracing::info!(
            resume_block,
            cursor = ?cursor,
            last_block = state.block.number,
            started_at = ?state.started_at,
            "resuming from saved state"
        );
        Ok(StreamRequest {
            cursor,
            start_block: resume_block,
            stop_block: self.stop_block,
        })
    }

    async fn handle(&mut self, data: BlockScopedData) -> Result<(), SinkError> {
        let progress = data.progress();
        let number = progress.block.number;

        let encoded = match self.encoder.encode(&data.output) {
            Ok(encoded) => Some(encoded),
            Err(err) if err.kind() == ErrorKind::Data => {
                self.summary.rejected += 1;
                tracing::error!(
                    block = number,
                    cursor = %data.cursor,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "payload rejected, block left out of the output"
                );
                None
            }
            Err(err) => return Err(err.into()),
        };

        for task in self.bundler.advance(progress).await? {
            self.queue.push(task).await?;
            self.summary.boundaries += 1;
        }

        match encoded {
            Some(Encoded::Bytes(bytes)) if !bytes.is_empty() => self.bundler.write(bytes).await?,
            Some(Encoded::Rows(rows)) => self.bundler.write_rows(rows).await?,
            Some(Encoded::Bytes(_)) | None => {}
        }

        self.summary.blocks += 1;
        tracing::trace!(block = number, "block processed");
        Ok(())
    }

    /// Closes the partial last boundary and enqueues it.
    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(task) = self.bundler.finish().await? {
            self.queue.push(task).await?;
            self.summary.boundaries += 1;
        }
        Ok(())
    }

    async fn abandon(&mut self) {
        if self.bundler.active_range().is_none() {
            return;
        }
        if let Err(err) = self.bundler.discard().await {
            tracing::warn!(
                error = %err,
                error_source = logging::error_source(&err),
                "failed to discard active boundary"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        path::Path as FsPath,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bundler::{
        BlockRef, FileType, StateStore, UploadQueueConfig,
        writer::{MemWriter, Writer},
    };
    use bytes::Bytes;
    use futures::stream::{self, StreamExt as _};
    use object_store::{ObjectStore, memory::InMemory};
    use prost::Message as _;
    use sink_object_store::ext::ObjectStoreExt as _;

    use super::*;
    use crate::{
        encoder::{Lines, LinesEncoder},
        source::{AnyOutput, Clock, SourceError, SourceStream},
    };

    const WINDOW: u64 = 10;

    fn config() -> UploadQueueConfig {
        UploadQueueConfig {
            workers: 2,
            capacity: 4,
            max_attempts: 2,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            grace_period: Duration::from_secs(5),
        }
    }

    fn lines_output(lines: &[String]) -> AnyOutput {
        let message = Lines {
            lines: lines.iter().map(|line| line.as_bytes().to_vec()).collect(),
        };
        AnyOutput {
            type_url: "type.googleapis.com/sf.substreams.sink.files.v1.Lines".to_string(),
            value: Bytes::from(message.encode_to_vec()),
        }
    }

    fn block(number: u64) -> SourceEvent {
        SourceEvent::Data(BlockScopedData {
            cursor: format!("cursor-{number}"),
            clock: Clock {
                id: format!("0x{number:x}"),
                number,
                timestamp: None,
            },
            output: lines_output(&[format!("{{\"block\":{number}}}")]),
        })
    }

    /// A source replaying `events`, recording the requests it receives.
    fn replay(
        events: Vec<Result<SourceEvent, SourceError>>,
        requests: Arc<Mutex<Vec<StreamRequest>>>,
    ) -> impl Fn(StreamRequest) -> SourceStream {
        let events = Arc::new(Mutex::new(Some(events)));
        move |request| {
            requests.lock().unwrap().push(request);
            let events = events.lock().unwrap().take().unwrap_or_default();
            stream::iter(events).boxed()
        }
    }

    struct Harness {
        store: Arc<dyn ObjectStore>,
        _dir: tempfile::TempDir,
        state_path: std::path::PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            Self {
                store: Arc::new(InMemory::new()),
                state_path: dir.path().join("state.yaml"),
                _dir: dir,
            }
        }

        fn sinker(&self, start_block: u64, stop_block: Option<u64>) -> Sinker {
            let (state, resume) = StateStore::open(&self.state_path).expect("state store");
            let writer: Box<dyn Writer> = Box::new(MemWriter::new(FileType::Jsonl));
            let bundler = Bundler::new(WINDOW, writer, false).expect("bundler");
            let queue = UploadQueue::new(Arc::clone(&self.store), state, config());
            Sinker::new(
                bundler,
                queue,
                Box::new(LinesEncoder),
                resume,
                start_block,
                stop_block,
            )
        }

        async fn files(&self) -> Vec<String> {
            let mut files: Vec<String> = self
                .store
                .list(None)
                .map(|meta| meta.expect("list").location.to_string())
                .collect()
                .await;
            files.sort();
            files
        }

        async fn content(&self, path: &str) -> String {
            let bytes = self.store.get_bytes(path).await.expect("get");
            String::from_utf8(bytes.to_vec()).expect("utf-8")
        }

        async fn exists(&self, path: &str) -> bool {
            self.store.exists(path).await.expect("head")
        }

        fn state(&self) -> PersistedState {
            read_state(&self.state_path)
        }
    }

    fn read_state(path: &FsPath) -> PersistedState {
        let content = std::fs::read_to_string(path).expect("state file");
        serde_yaml::from_str(&content).expect("valid state")
    }

    #[tokio::test]
    async fn closes_boundaries_and_uploads_the_partial_last_one() {
        //* Given
        let harness = Harness::new();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let events = [3, 5, 12, 13, 31].into_iter().map(|n| Ok(block(n))).collect();
        let source = replay(events, Arc::clone(&requests));

        //* When
        let summary = harness
            .sinker(3, None)
            .run(&source, CancellationToken::new())
            .await
            .expect("run");

        //* Then
        assert_eq!(
            summary,
            SinkSummary {
                blocks: 5,
                rejected: 0,
                undo_signals: 0,
                boundaries: 4,
            }
        );
        assert_eq!(
            harness.files().await,
            vec![
                "0000000003-0000000010.jsonl",
                "0000000010-0000000020.jsonl",
                "0000000020-0000000030.jsonl",
                "0000000030-0000000032.jsonl",
            ]
        );
        assert_eq!(
            harness.content("0000000003-0000000010.jsonl").await,
            "{\"block\":3}\n{\"block\":5}\n"
        );
        assert_eq!(harness.content("0000000020-0000000030.jsonl").await, "");

        let state = harness.state();
        assert_eq!(state.cursor, "cursor-31");
        assert_eq!(state.resume_block(), 32);

        let requests = requests.lock().unwrap();
        assert_eq!(
            *requests,
            vec![StreamRequest {
                cursor: None,
                start_block: 3,
                stop_block: None,
            }]
        );
    }

    #[tokio::test]
    async fn resumes_from_the_saved_cursor() {
        //* Given
        let harness = Harness::new();
        let first = replay(
            [0, 4, 11].into_iter().map(|n| Ok(block(n))).collect(),
            Arc::new(Mutex::new(Vec::new())),
        );
        harness
            .sinker(0, Some(15))
            .run(&first, CancellationToken::new())
            .await
            .expect("first run");
        assert_eq!(harness.state().resume_block(), 12);

        let requests = Arc::new(Mutex::new(Vec::new()));
        let second = replay(
            [14, 20].into_iter().map(|n| Ok(block(n))).collect(),
            Arc::clone(&requests),
        );

        //* When
        let summary = harness
            .sinker(0, Some(20))
            .run(&second, CancellationToken::new())
            .await
            .expect("second run");

        //* Then
        assert_eq!(summary.blocks, 1);
        assert_eq!(
            *requests.lock().unwrap(),
            vec![StreamRequest {
                cursor: Some("cursor-11".to_string()),
                start_block: 12,
                stop_block: Some(20),
            }]
        );
        assert_eq!(
            harness.files().await,
            vec![
                "0000000000-0000000010.jsonl",
                "0000000010-0000000012.jsonl",
                "0000000012-0000000015.jsonl",
            ]
        );
        assert_eq!(harness.state().cursor, "cursor-14");
    }

    #[tokio::test]
    async fn cancellation_discards_the_active_boundary() {
        //* Given
        let harness = Harness::new();
        let cancel = CancellationToken::new();
        let pending = stream::iter([0, 1, 12].into_iter().map(|n| Ok(block(n))))
            .chain(stream::pending());
        let pending = Arc::new(Mutex::new(Some(pending.boxed())));
        let source = move |_request: StreamRequest| -> SourceStream {
            pending
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| stream::empty().boxed())
        };

        //* When
        let (result, ()) = tokio::join!(
            harness.sinker(0, None).run(&source, cancel.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );
        let summary = result.expect("run");

        //* Then
        assert_eq!(summary.blocks, 3);
        assert_eq!(harness.files().await, vec!["0000000000-0000000010.jsonl"]);
        assert!(!harness.exists("0000000010-0000000013.jsonl").await);
        assert_eq!(harness.state().resume_block(), 10);
    }

    #[tokio::test]
    async fn rejected_payloads_still_advance_the_boundaries() {
        //* Given
        let harness = Harness::new();
        let garbage = SourceEvent::Data(BlockScopedData {
            cursor: "cursor-5".to_string(),
            clock: Clock {
                id: "0x5".to_string(),
                number: 5,
                timestamp: None,
            },
            output: AnyOutput {
                type_url: String::new(),
                value: Bytes::from_static(&[0x0a, 0xff]),
            },
        });
        let source = replay(
            vec![Ok(block(1)), Ok(garbage), Ok(block(10))],
            Arc::new(Mutex::new(Vec::new())),
        );

        //* When
        let summary = harness
            .sinker(0, None)
            .run(&source, CancellationToken::new())
            .await
            .expect("run");

        //* Then
        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.rejected, 1);
        assert_eq!(
            harness.content("0000000000-0000000010.jsonl").await,
            "{\"block\":1}\n"
        );
    }

    #[tokio::test]
    async fn undo_signals_are_counted_and_ignored() {
        //* Given
        let harness = Harness::new();
        let undo = SourceEvent::Undo {
            last_valid_block: BlockRef {
                id: "0x1".to_string(),
                number: 1,
            },
            last_valid_cursor: "cursor-1".to_string(),
        };
        let source = replay(
            vec![Ok(block(1)), Ok(block(2)), Ok(undo), Ok(block(3))],
            Arc::new(Mutex::new(Vec::new())),
        );

        //* When
        let summary = harness
            .sinker(0, None)
            .run(&source, CancellationToken::new())
            .await
            .expect("run");

        //* Then
        assert_eq!(summary.undo_signals, 1);
        assert_eq!(
            harness.content("0000000000-0000000004.jsonl").await,
            "{\"block\":1}\n{\"block\":2}\n{\"block\":3}\n"
        );
    }

    #[tokio::test]
    async fn source_errors_stop_the_run_after_draining() {
        //* Given
        let harness = Harness::new();
        let failure = SourceError("connection reset".into());
        let source = replay(
            vec![Ok(block(1)), Ok(block(11)), Err(failure)],
            Arc::new(Mutex::new(Vec::new())),
        );

        //* When
        let result = harness
            .sinker(0, None)
            .run(&source, CancellationToken::new())
            .await;

        //* Then
        let err = result.expect_err("source failure");
        assert!(matches!(err, SinkError::Source(_)));
        assert_eq!(harness.files().await, vec!["0000000000-0000000010.jsonl"]);
        assert_eq!(harness.state().resume_block(), 10);
    }
}
