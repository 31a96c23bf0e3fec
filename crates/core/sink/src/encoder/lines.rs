use bundler::FileType;
use bytes::{BufMut, BytesMut};
use prost::Message as _;

use super::{Encoded, Encoder};
use crate::{error::EncodeError, source::AnyOutput};

const LINES_MESSAGE: &str = "sf.substreams.sink.files.v1.Lines";

/// Pre-rendered lines produced by the upstream module.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Lines {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub lines: Vec<Vec<u8>>,
}

/// Writes every entry of a `Lines` payload followed by a newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinesEncoder;

impl Encoder for LinesEncoder {
    fn file_type(&self) -> FileType {
        FileType::Jsonl
    }

    fn encode(&self, output: &AnyOutput) -> Result<Encoded, EncodeError> {
        let lines = Lines::decode(output.value.as_ref()).map_err(|source| EncodeError::Decode {
            message: LINES_MESSAGE.to_string(),
            source,
        })?;

        let size = lines.lines.iter().map(|line| line.len() + 1).sum();
        let mut buf = BytesMut::with_capacity(size);
        for line in &lines.lines {
            buf.put_slice(line);
            buf.put_u8(b'\n');
        }
        Ok(Encoded::Bytes(buf.freeze()))
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use prost::Message as _;

    use super::*;

    fn output(lines: &[&str]) -> AnyOutput {
        let message = Lines {
            lines: lines.iter().map(|line| line.as_bytes().to_vec()).collect(),
        };
        AnyOutput {
            type_url: format!("type.googleapis.com/{LINES_MESSAGE}"),
            value: Bytes::from(message.encode_to_vec()),
        }
    }

    fn bytes(encoded: Encoded) -> Bytes {
        match encoded {
            Encoded::Bytes(bytes) => bytes,
            Encoded::Rows(_) => panic!("lines encoder produced rows"),
        }
    }

    #[test]
    fn no_line_writes_nothing() {
        let encoded = LinesEncoder.encode(&output(&[])).expect("encode");

        assert!(bytes(encoded).is_empty());
    }

    #[test]
    fn every_line_ends_with_a_newline() {
        let encoded = LinesEncoder
            .encode(&output(&[r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]))
            .expect("encode");

        assert_eq!(
            bytes(encoded),
            Bytes::from_static(b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n")
        );
    }

    #[test]
    fn garbage_is_a_data_error() {
        let result = LinesEncoder.encode(&AnyOutput {
            type_url: String::new(),
            value: Bytes::from_static(&[0x0a, 0xff]),
        });

        let err = result.expect_err("invalid payload");
        assert_eq!(err.kind(), bundler::ErrorKind::Data);
    }
}
