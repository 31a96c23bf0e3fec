//! Error types of the boundary lifecycle and the upload pipeline.
//!
//! Every error maps to an [`ErrorKind`] which tells the caller how to react: configuration and
//! lifecycle errors are fatal immediately, data errors reject a single item, transient I/O
//! errors are retried where a retry makes sense and become fatal once retries are exhausted.

use std::{path::PathBuf, time::Duration};

use object_store::path::Path;

use crate::{range::BlockRange, writer::FileType};

/// Classification of every error raised by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid settings or schema, detected eagerly and never retried.
    Configuration,
    /// Store or filesystem I/O that may succeed on a later attempt.
    TransientIo,
    /// A malformed item, rejected on its own.
    Data,
    /// A call made in the wrong state, which is a programming error.
    Lifecycle,
}

/// Errors raised by [`Writer`](crate::Writer) implementations.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// `start_boundary` was called while a boundary is still open.
    ///
    /// The bundler always closes or discards before starting, so this is a lifecycle bug.
    #[error("boundary {active} is still active")]
    AlreadyActive { active: BlockRange },

    /// A write, close or discard was issued with no open boundary.
    #[error("no active boundary")]
    NoActiveBoundary,

    /// The range given at close does not start where the open boundary starts, or ends past it.
    #[error("cannot close boundary {active} as {requested}")]
    RangeMismatch {
        active: BlockRange,
        requested: BlockRange,
    },

    /// The writer does not accept this kind of input.
    ///
    /// Byte writers reject rows and the columnar writer rejects raw bytes. Pair each encoder
    /// with a writer of the matching file type.
    #[error("{file_type} writer does not accept {input}")]
    UnsupportedInput {
        file_type: FileType,
        input: &'static str,
    },

    /// The date partition format contains an invalid strftime specifier.
    #[error("invalid date partition format {format:?}")]
    InvalidDateFormat { format: String },

    /// Rows were written for a table the writer does not know.
    #[error("unknown table '{table}'")]
    UnknownTable { table: String },

    /// Rows could not be buffered or serialized into the columnar file.
    #[error("failed to buffer rows")]
    Rows(#[source] parquet_rows::RowError),

    /// The local working directory or file could not be created.
    #[error("failed to create working file {}", path.display())]
    CreateWorkingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing or flushing the local working file failed.
    #[error("failed to write working file {}", path.display())]
    LocalWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Removing the local working file of a discarded boundary failed.
    #[error("failed to remove working file {}", path.display())]
    RemoveWorkingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Streaming into the working object failed, reported by the drain task.
    #[error("failed to stream into working object {path}")]
    DrainWrite {
        path: Path,
        #[source]
        source: std::io::Error,
    },

    /// The drain task stopped before the boundary was closed.
    ///
    /// The actual failure is reported when the boundary closes.
    #[error("drain task of working object {path} stopped")]
    DrainStopped { path: Path },

    /// The drain task panicked or was cancelled.
    #[error("drain task of working object {path} did not complete")]
    DrainTask {
        path: Path,
        #[source]
        source: tokio::task::JoinError,
    },

    /// Deleting the working object of a discarded boundary failed.
    #[error("failed to delete working object {path}")]
    DeleteWorkingObject {
        path: Path,
        #[source]
        source: object_store::Error,
    },
}

impl WriterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriterError::AlreadyActive { .. }
            | WriterError::NoActiveBoundary
            | WriterError::RangeMismatch { .. }
            | WriterError::DrainTask { .. } => ErrorKind::Lifecycle,
            WriterError::UnsupportedInput { .. } | WriterError::InvalidDateFormat { .. } => {
                ErrorKind::Configuration
            }
            WriterError::UnknownTable { .. } | WriterError::Rows(_) => ErrorKind::Data,
            WriterError::CreateWorkingFile { .. }
            | WriterError::LocalWrite { .. }
            | WriterError::RemoveWorkingFile { .. }
            | WriterError::DrainWrite { .. }
            | WriterError::DrainStopped { .. }
            | WriterError::DeleteWorkingObject { .. } => ErrorKind::TransientIo,
        }
    }
}

/// Errors raised while uploading an artifact to the output store.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Writing the object to the output store failed.
    #[error("failed to put object {path}")]
    Put {
        path: Path,
        #[source]
        source: object_store::Error,
    },

    /// Streaming the object to the output store failed.
    #[error("failed to stream object {path}")]
    Stream {
        path: Path,
        #[source]
        source: std::io::Error,
    },

    /// The local file backing the artifact could not be read.
    #[error("failed to read local file {}", path.display())]
    ReadLocal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The working object backing the artifact could not be read.
    #[error("failed to read working object {path}")]
    ReadWorking {
        path: Path,
        #[source]
        source: object_store::Error,
    },

    /// Releasing the local file after a successful upload failed.
    #[error("failed to remove local file {}", path.display())]
    CleanupLocal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Releasing the working object after a successful upload failed.
    #[error("failed to delete working object {path}")]
    CleanupWorking {
        path: Path,
        #[source]
        source: object_store::Error,
    },
}

impl UploadError {
    /// Whether another attempt may succeed.
    ///
    /// A missing backing file or object will stay missing, every other store or filesystem
    /// failure is worth a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Put { .. } | UploadError::Stream { .. } => true,
            UploadError::ReadLocal { source, .. } => {
                source.kind() != std::io::ErrorKind::NotFound
            }
            UploadError::ReadWorking { source, .. } => {
                !matches!(source, object_store::Error::NotFound { .. })
            }
            UploadError::CleanupLocal { .. } | UploadError::CleanupWorking { .. } => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransientIo
    }
}

/// Errors raised while reading or saving the persisted state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The state file exists but could not be read.
    #[error("failed to read state file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file is not valid YAML or does not match the state layout.
    ///
    /// Fix or remove the file, removing it restarts from the configured start block.
    #[error("failed to parse state file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The state could not be rendered as YAML.
    #[error("failed to serialize state")]
    Serialize(#[source] serde_yaml::Error),

    /// Writing the temporary state file or moving it in place failed.
    #[error("failed to write state file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::Read { .. } | StateError::Write { .. } => ErrorKind::TransientIo,
            StateError::Parse { .. } => ErrorKind::Configuration,
            StateError::Serialize(_) => ErrorKind::Lifecycle,
        }
    }
}

/// Errors raised by the [`Bundler`](crate::Bundler) and the [`UploadQueue`](crate::UploadQueue).
#[derive(Debug, thiserror::Error)]
pub enum BundlerError {
    /// Boundaries must span at least one block.
    #[error("window size must be greater than zero")]
    InvalidWindowSize,

    /// `advance` or `close` was called before `start`.
    #[error("bundler has no active boundary")]
    NotStarted,

    /// `start` was called while a boundary is active.
    #[error("bundler already has active boundary {active}")]
    AlreadyStarted { active: BlockRange },

    /// A block arrived below the active boundary or below the last processed block.
    ///
    /// The source delivers blocks in increasing order, this means it was resumed from the
    /// wrong cursor.
    #[error("block {block} is out of order, expected at least {expected}")]
    BlockOutOfOrder { block: u64, expected: u64 },

    /// The window opened at `block` would end past `u64::MAX`.
    #[error("window of {size} blocks starting at block {block} overflows")]
    WindowOverflow { block: u64, size: u64 },

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    State(#[from] StateError),

    /// An artifact could not be uploaded within the retry budget.
    ///
    /// Dropping it would leave a permanent gap in the output, so this is fatal.
    #[error("failed to upload boundary {range} after {attempts} attempts")]
    UploadFailed {
        range: BlockRange,
        attempts: usize,
        #[source]
        source: UploadError,
    },

    /// The upload queue no longer accepts tasks, either shut down or stopped by a failure.
    #[error("upload queue is closed")]
    QueueClosed,

    /// In-flight uploads did not finish within the shutdown grace period.
    #[error("uploads did not drain within {grace:?}")]
    ShutdownTimeout { grace: Duration },

    /// An upload worker panicked.
    #[error("upload worker failed")]
    Worker(#[source] tokio::task::JoinError),
}

impl BundlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundlerError::InvalidWindowSize => ErrorKind::Configuration,
            BundlerError::BlockOutOfOrder { .. } | BundlerError::WindowOverflow { .. } => {
                ErrorKind::Data
            }
            BundlerError::Writer(err) => err.kind(),
            BundlerError::State(err) => err.kind(),
            BundlerError::UploadFailed { .. } => ErrorKind::TransientIo,
            BundlerError::NotStarted
            | BundlerError::AlreadyStarted { .. }
            | BundlerError::QueueClosed
            | BundlerError::ShutdownTimeout { .. }
            | BundlerError::Worker(_) => ErrorKind::Lifecycle,
        }
    }
}
