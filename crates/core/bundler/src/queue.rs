//! Bounded-concurrency upload of closed boundaries.
//!
//! Tasks are consumed in close order by a fixed pool of workers sharing one channel receiver.
//! Each upload is retried with exponential backoff. The checkpoint of a task is handed to the
//! [`Checkpointer`] only after its upload succeeded, so the state file never moves past a
//! boundary that is not in the output store. An upload that exhausts its attempts stops the
//! whole queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use monitoring::logging;
use object_store::ObjectStore;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bundler::UploadTask,
    checkpoint::Checkpointer,
    error::{BundlerError, UploadError},
    state::StateStore,
};

#[derive(Debug, Clone)]
pub struct UploadQueueConfig {
    /// Uploads running at the same time.
    pub workers: usize,
    /// Closed boundaries waiting for a worker before `push` blocks.
    pub capacity: usize,
    /// Attempts per upload, the first one included.
    pub max_attempts: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Time given to in-flight uploads at shutdown.
    pub grace_period: Duration,
}

impl Default for UploadQueueConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            capacity: 64,
            max_attempts: 3,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
        }
    }
}

impl UploadQueueConfig {
    fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

struct Queued {
    seq: u64,
    task: UploadTask,
}

/// Uploads closed boundaries and checkpoints them in order.
pub struct UploadQueue {
    sender: mpsc::Sender<Queued>,
    workers: JoinSet<Result<(), BundlerError>>,
    failed: CancellationToken,
    checkpointer: Arc<Checkpointer>,
    next_seq: u64,
    grace_period: Duration,
}

impl UploadQueue {
    /// Spawns the workers, which must happen inside a tokio runtime.
    pub fn new(store: Arc<dyn ObjectStore>, state: StateStore, config: UploadQueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let checkpointer = Arc::new(Checkpointer::new(state));
        let failed = CancellationToken::new();

        let mut workers = JoinSet::new();
        for id in 0..config.workers.max(1) {
            let worker = Worker {
                id,
                receiver: Arc::clone(&receiver),
                store: Arc::clone(&store),
                checkpointer: Arc::clone(&checkpointer),
                config: config.clone(),
                failed: failed.clone(),
            };
            workers.spawn(worker.run());
        }

        tracing::debug!(
            workers = config.workers.max(1),
            capacity = config.capacity.max(1),
            max_attempts = config.max_attempts,
            "upload queue started"
        );

        Self {
            sender,
            workers,
            failed,
            checkpointer,
            next_seq: 0,
            grace_period: config.grace_period,
        }
    }

    /// Enqueues a closed boundary, waiting while the queue is full.
    ///
    /// Fails with [`BundlerError::QueueClosed`] once a worker failed, the failure itself is
    /// returned by [`UploadQueue::shutdown`].
    pub async fn push(&mut self, task: UploadTask) -> Result<(), BundlerError> {
        let range = task.range;
        let queued = Queued {
            seq: self.next_seq,
            task,
        };

        tokio::select! {
            biased;
            _ = self.failed.cancelled() => return Err(BundlerError::QueueClosed),
            sent = self.sender.send(queued) => sent.map_err(|_| BundlerError::QueueClosed)?,
        }

        tracing::debug!(boundary = %range, seq = self.next_seq, "upload queued");
        self.next_seq += 1;
        Ok(())
    }

    /// Whether a worker stopped on an error.
    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Resolves once a worker stopped on an error.
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    /// Stops accepting tasks and waits for the queued uploads within the grace period.
    ///
    /// Returns the first worker error, or [`BundlerError::ShutdownTimeout`] if uploads were
    /// still running when the grace period ended, in which case they are aborted.
    pub async fn shutdown(self) -> Result<(), BundlerError> {
        let Self {
            sender,
            mut workers,
            checkpointer,
            grace_period,
            ..
        } = self;
        drop(sender);

        let outcome = tokio::time::timeout(grace_period, join_workers(&mut workers)).await;

        let pending = checkpointer.pending().await;
        if pending > 0 {
            tracing::warn!(pending, "uploaded boundaries left without checkpoint");
        }

        match outcome {
            Ok(None) => {
                tracing::debug!("upload queue drained");
                Ok(())
            }
            Ok(Some(err)) => Err(err),
            Err(_) => {
                workers.abort_all();
                tracing::error!(grace = ?grace_period, "uploads did not drain in time, aborting");
                Err(BundlerError::ShutdownTimeout {
                    grace: grace_period,
                })
            }
        }
    }
}

/// Joins every worker, returning the first failure.
async fn join_workers(workers: &mut JoinSet<Result<(), BundlerError>>) -> Option<BundlerError> {
    let mut first = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => {
                first.get_or_insert(err);
            }
            Err(err) if err.is_cancelled() => {
                tracing::trace!("upload worker {} was cancelled", err.id());
            }
            Err(err) => {
                tracing::error!(error = ?err, "upload worker {} panicked", err.id());
                first.get_or_insert(BundlerError::Worker(err));
            }
        }
    }
    first
}

struct Worker {
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Queued>>>,
    store: Arc<dyn ObjectStore>,
    checkpointer: Arc<Checkpointer>,
    config: UploadQueueConfig,
    failed: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<(), BundlerError> {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.failed.cancelled() => None,
                    next = receiver.recv() => next,
                }
            };
            let Some(Queued { seq, task }) = next else {
                return Ok(());
            };

            if let Err(err) = self.process(seq, task).await {
                tracing::error!(
                    worker = self.id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "upload worker stopped"
                );
                self.failed.cancel();
                return Err(err);
            }
        }
    }

    #[tracing::instrument(skip_all, fields(worker = self.id, boundary = %task.range), err)]
    async fn process(&self, seq: u64, task: UploadTask) -> Result<(), BundlerError> {
        let UploadTask {
            range,
            artifact,
            checkpoint,
        } = task;

        let attempts = AtomicUsize::new(0);
        let paths = (|| async {
            attempts.fetch_add(1, Ordering::Relaxed);
            artifact.upload(&self.store).await
        })
        .retry(self.config.retry_policy())
        .when(UploadError::is_retryable)
        .notify(|err, dur| {
            tracing::warn!(
                boundary = %range,
                attempt = attempts.load(Ordering::Relaxed),
                error = %err,
                error_source = logging::error_source(err),
                "Upload failed. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
        .map_err(|source| BundlerError::UploadFailed {
            range,
            attempts: attempts.load(Ordering::Relaxed),
            source,
        })?;

        tracing::debug!(boundary = %range, paths = ?paths, "boundary uploaded");

        if let Err(err) = artifact.cleanup().await {
            tracing::warn!(
                boundary = %range,
                error = %err,
                error_source = logging::error_source(&err),
                "failed to release uploaded artifact"
            );
        }

        match self.checkpointer.complete(seq, checkpoint).await? {
            Some(state) => tracing::info!(
                boundary = %range,
                cursor = %state.cursor,
                resume_block = state.resume_block(),
                "checkpoint saved"
            ),
            None => tracing::debug!(
                boundary = %range,
                "uploaded, checkpoint waits for earlier boundaries"
            ),
        }

        Ok(())
    }
}
