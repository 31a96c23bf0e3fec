//! Per-payload transforms feeding the active writer.
//!
//! Encoding is pure: no I/O happens here, a payload either becomes bytes or rows for the
//! boundary it belongs to, or is rejected with a data error before anything is written.

mod columnar;
mod json;
mod lines;

use bundler::FileType;
use bytes::Bytes;
use parquet_rows::RowsByTable;
use prost_reflect::MessageDescriptor;

pub use self::{columnar::ParquetEncoder, json::JsonEncoder, lines::{Lines, LinesEncoder}};
use crate::{error::EncodeError, source::AnyOutput};

/// Content produced for one payload.
#[derive(Debug)]
pub enum Encoded {
    Bytes(Bytes),
    Rows(RowsByTable),
}

pub trait Encoder: Send + Sync {
    /// Kind of file the encoded content belongs in.
    fn file_type(&self) -> FileType;

    fn encode(&self, output: &AnyOutput) -> Result<Encoded, EncodeError>;
}

/// Rejects payloads whose type URL names another message than `expected`.
///
/// Payloads without a type URL are accepted as is.
fn check_type(expected: &MessageDescriptor, output: &AnyOutput) -> Result<(), EncodeError> {
    let actual = output.message_name();
    if actual.is_empty() || actual == expected.full_name() {
        return Ok(());
    }
    Err(EncodeError::TypeMismatch {
        expected: expected.full_name().to_string(),
        actual: actual.to_string(),
    })
}
