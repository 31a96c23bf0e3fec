use std::path::PathBuf;

use bundler::{BundlerError, ErrorKind};
use parquet_rows::{RowError, SchemaError};

use crate::source::SourceError;

/// Errors raised while building an encoder or encoding one payload.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The configured output type is not in the descriptor set.
    #[error("message '{name}' not found in the descriptor set")]
    UnknownMessage { name: String },

    /// The configured JSON rows field is missing or not a repeated message field.
    #[error("field '{field}' of '{message}' is not a repeated message field")]
    InvalidRowsField { message: String, field: String },

    /// Tables could not be derived from the output type.
    #[error("failed to derive tables")]
    Schema(#[source] SchemaError),

    /// The payload carries another message type than the configured one.
    #[error("payload of type '{actual}' does not match output type '{expected}'")]
    TypeMismatch { expected: String, actual: String },

    /// The payload bytes are not a valid encoding of the message.
    #[error("failed to decode payload as '{message}'")]
    Decode {
        message: String,
        #[source]
        source: prost::DecodeError,
    },

    /// The decoded message could not be rendered as JSON.
    #[error("failed to render '{message}' as JSON")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// The payload could not be flattened into rows.
    #[error("failed to extract rows")]
    Rows(#[source] RowError),
}

impl EncodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EncodeError::UnknownMessage { .. }
            | EncodeError::InvalidRowsField { .. }
            | EncodeError::Schema(_) => ErrorKind::Configuration,
            EncodeError::TypeMismatch { .. }
            | EncodeError::Decode { .. }
            | EncodeError::Json { .. }
            | EncodeError::Rows(_) => ErrorKind::Data,
        }
    }
}

/// Errors that stop the sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The configured output store location is not a valid URL or path.
    #[error("invalid output store location")]
    StoreUrl(#[source] sink_object_store::url::ObjectStoreUrlError),

    /// The output or working store backend could not be created.
    #[error(transparent)]
    Store(#[from] sink_object_store::ObjectStoreCreationError),

    /// A setting required by the configured encoder is missing.
    #[error("{0} must be set")]
    MissingSetting(&'static str),

    /// The working directory could not be created.
    #[error("failed to create working directory {}", path.display())]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The descriptor set file could not be read.
    #[error("failed to read descriptor set {}", path.display())]
    ReadDescriptorSet {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The descriptor set file is not a valid `FileDescriptorSet`.
    #[error("failed to decode descriptor set {}", path.display())]
    DecodeDescriptorSet {
        path: PathBuf,
        #[source]
        source: prost_reflect::DescriptorError,
    },

    /// The encoder could not be built, or a payload failed in a way that is not item specific.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Bundler(#[from] BundlerError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::StoreUrl(_)
            | SinkError::Store(_)
            | SinkError::MissingSetting(_)
            | SinkError::ReadDescriptorSet { .. }
            | SinkError::DecodeDescriptorSet { .. } => ErrorKind::Configuration,
            SinkError::WorkingDir { .. } | SinkError::Source(_) => ErrorKind::TransientIo,
            SinkError::Encode(err) => err.kind(),
            SinkError::Bundler(err) => err.kind(),
        }
    }
}
