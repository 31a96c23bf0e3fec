//! Interface of the upstream block stream.
//!
//! The transport is not part of this crate, anything able to turn a [`StreamRequest`] into a
//! stream of [`SourceEvent`] can feed the sink.

use bundler::{BlockRef, Progress};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type SourceStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

/// Where the source should begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Resume right after this cursor when set.
    pub cursor: Option<String>,
    /// First block when there is no cursor.
    pub start_block: u64,
    /// Exclusive end, the stream is unbounded when unset.
    pub stop_block: Option<u64>,
}

/// Provider of block streams, possibly reconnecting on its own.
pub trait Source: Send + Sync {
    fn stream(&self, request: StreamRequest) -> SourceStream;
}

impl<F> Source for F
where
    F: Fn(StreamRequest) -> SourceStream + Send + Sync,
{
    fn stream(&self, request: StreamRequest) -> SourceStream {
        self(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    pub id: String,
    pub number: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Encoded output message with its protobuf type URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyOutput {
    pub type_url: String,
    pub value: Bytes,
}

impl AnyOutput {
    /// Message full name carried by the type URL, `type.googleapis.com/erc20.v1.Transfers`
    /// naming `erc20.v1.Transfers`.
    pub fn message_name(&self) -> &str {
        self.type_url
            .rsplit_once('/')
            .map_or(self.type_url.as_str(), |(_, name)| name)
    }
}

/// The output of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockScopedData {
    /// Opaque resumption token, resuming from it delivers the blocks after this one.
    pub cursor: String,
    pub clock: Clock,
    pub output: AnyOutput,
}

impl BlockScopedData {
    pub fn progress(&self) -> Progress {
        Progress {
            cursor: self.cursor.clone(),
            block: BlockRef {
                id: self.clock.id.clone(),
                number: self.clock.number,
            },
            timestamp: self.clock.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Data(BlockScopedData),
    /// Blocks after `last_valid_block` were reverted by a reorganization.
    Undo {
        last_valid_block: BlockRef,
        last_valid_cursor: String,
    },
}

/// The source stream failed and could not recover on its own.
#[derive(Debug, thiserror::Error)]
#[error("block source failed")]
pub struct SourceError(#[source] pub BoxError);
