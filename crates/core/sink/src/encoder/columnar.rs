use bundler::FileType;
use parquet_rows::TableSet;
use prost_reflect::MessageDescriptor;

use super::{Encoded, Encoder, check_type};
use crate::{error::EncodeError, source::AnyOutput};

/// Flattens decoded payloads into rows of the derived tables.
#[derive(Debug, Clone)]
pub struct ParquetEncoder {
    root: MessageDescriptor,
    tables: TableSet,
}

impl ParquetEncoder {
    pub fn new(root: MessageDescriptor, tables: TableSet) -> Self {
        Self { root, tables }
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }
}

impl Encoder for ParquetEncoder {
    fn file_type(&self) -> FileType {
        FileType::Parquet
    }

    fn encode(&self, output: &AnyOutput) -> Result<Encoded, EncodeError> {
        check_type(&self.root, output)?;
        self.tables
            .decode_rows(&self.root, output.value.as_ref())
            .map(Encoded::Rows)
            .map_err(EncodeError::Rows)
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use parquet_rows::{SchemaOptions, derive_tables};

    use super::*;
    use crate::encoder::test_descriptors;

    fn encoder() -> ParquetEncoder {
        let root = test_descriptors::pool()
            .get_message_by_name("erc20.v1.Transfers")
            .expect("Transfers descriptor");
        let tables = derive_tables(&root, &SchemaOptions::default()).expect("tables");
        ParquetEncoder::new(root, tables)
    }

    fn payload(count: u64) -> AnyOutput {
        AnyOutput {
            type_url: "type.googleapis.com/erc20.v1.Transfers".to_string(),
            value: test_descriptors::transfers_payload(count),
        }
    }

    #[test]
    fn every_list_element_is_a_row() {
        //* Given
        let encoder = encoder();

        //* When
        let encoded = encoder.encode(&payload(3)).expect("encode");

        //* Then
        let Encoded::Rows(rows) = encoded else {
            panic!("parquet encoder produced bytes");
        };
        assert_eq!(rows.len(), 1);
        let (table, rows) = rows.into_iter().next().expect("one table");
        assert_eq!(table, "transfers");
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn undecodable_payload_is_a_data_error() {
        let encoder = encoder();

        let result = encoder.encode(&AnyOutput {
            type_url: String::new(),
            value: Bytes::from_static(&[0x0a, 0x05, 0x01]),
        });

        let err = result.expect_err("truncated payload");
        assert!(matches!(err, EncodeError::Rows(_)));
        assert_eq!(err.kind(), bundler::ErrorKind::Data);
    }
}
