//! Block-range windowing of a block stream into files, and the crash-safe upload pipeline.
//!
//! A [`Bundler`] owns the single active [`BlockRange`] and decides when it closes. Closing asks
//! the [`Writer`] for an [`Uploadable`] artifact which is handed, together with a state snapshot,
//! to the [`UploadQueue`]. The snapshot is persisted by the [`StateStore`] only after the
//! artifact is uploaded.

pub mod bundler;
mod checkpoint;
pub mod error;
pub mod queue;
pub mod range;
pub mod state;
pub mod uploadable;
pub mod writer;

pub use self::{
    bundler::{Bundler, Progress, UploadTask},
    error::{BundlerError, ErrorKind, StateError, UploadError, WriterError},
    queue::{UploadQueue, UploadQueueConfig},
    range::BlockRange,
    state::{ActiveBoundary, BlockRef, Checkpoint, PersistedState, StateStore},
    uploadable::Uploadable,
    writer::{FileType, Writer},
};
