//! Materializes a block-scoped data stream into range-bounded files in an object store.
//!
//! A [`Source`] delivers block payloads in increasing block order. Each payload goes through an
//! [`Encoder`](encoder::Encoder) into the [`bundler::Bundler`], which cuts the stream into
//! fixed-size block ranges, and every closed range is uploaded by the
//! [`bundler::UploadQueue`] before its checkpoint is saved. The [`Sinker`] drives the loop,
//! [`setup::build`] assembles one from a [`sink_config::ConfigFile`].

pub mod encoder;
pub mod error;
pub mod setup;
pub mod sinker;
pub mod source;

pub use self::{
    error::{EncodeError, SinkError},
    sinker::{SinkSummary, Sinker},
    source::{AnyOutput, BlockScopedData, Clock, Source, SourceError, SourceEvent, StreamRequest},
};
