use bundler::FileType;
use bytes::{BufMut, BytesMut};
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage as _, Value,
};

use super::{Encoded, Encoder, check_type};
use crate::{error::EncodeError, source::AnyOutput};

/// Renders decoded payloads as newline-delimited JSON.
///
/// Without a rows field every payload is one line. With one, every element of that repeated
/// message field is a line and the rest of the payload is left out.
#[derive(Debug, Clone)]
pub struct JsonEncoder {
    message: MessageDescriptor,
    rows_field: Option<FieldDescriptor>,
}

impl JsonEncoder {
    pub fn new(message: MessageDescriptor, rows_field: Option<&str>) -> Result<Self, EncodeError> {
        let rows_field = match rows_field {
            None => None,
            Some(name) => {
                let field = message
                    .get_field_by_name(name)
                    .filter(|field| field.is_list() && matches!(field.kind(), Kind::Message(_)))
                    .ok_or_else(|| EncodeError::InvalidRowsField {
                        message: message.full_name().to_string(),
                        field: name.to_string(),
                    })?;
                Some(field)
            }
        };

        Ok(Self {
            message,
            rows_field,
        })
    }

    fn render(&self, buf: &mut BytesMut, message: &DynamicMessage) -> Result<(), EncodeError> {
        let line = serde_json::to_vec(message).map_err(|source| EncodeError::Json {
            message: message.descriptor().full_name().to_string(),
            source,
        })?;
        buf.put_slice(&line);
        buf.put_u8(b'\n');
        Ok(())
    }
}

impl Encoder for JsonEncoder {
    fn file_type(&self) -> FileType {
        FileType::Jsonl
    }

    fn encode(&self, output: &AnyOutput) -> Result<Encoded, EncodeError> {
        check_type(&self.message, output)?;

        let message = DynamicMessage::decode(self.message.clone(), output.value.as_ref())
            .map_err(|source| EncodeError::Decode {
                message: self.message.full_name().to_string(),
                source,
            })?;

        let mut buf = BytesMut::new();
        match &self.rows_field {
            None => self.render(&mut buf, &message)?,
            Some(field) => {
                if let Value::List(rows) = &*message.get_field(field) {
                    for row in rows {
                        if let Value::Message(row) = row {
                            self.render(&mut buf, row)?;
                        }
                    }
                }
            }
        }
        Ok(Encoded::Bytes(buf.freeze()))
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use prost::Message as _;

    use super::*;
    use crate::encoder::test_descriptors;

    fn transfers_descriptor() -> MessageDescriptor {
        test_descriptors::pool()
            .get_message_by_name("erc20.v1.Transfers")
            .expect("Transfers descriptor")
    }

    fn transfers_payload() -> Bytes {
        let root = transfers_descriptor();
        let transfer = root
            .get_field_by_name("transfers")
            .and_then(|field| match field.kind() {
                Kind::Message(message) => Some(message),
                _ => None,
            })
            .expect("Transfer descriptor");

        let row = |from: &str, amount: u64| {
            let mut message = DynamicMessage::new(transfer.clone());
            message.set_field_by_name("from", Value::String(from.to_string()));
            message.set_field_by_name("amount", Value::U64(amount));
            Value::Message(message)
        };

        let mut message = DynamicMessage::new(root);
        message.set_field_by_name("transfers", Value::List(vec![row("0xa", 1), row("0xb", 2)]));
        message.set_field_by_name("note", Value::String("batch".to_string()));
        Bytes::from(message.encode_to_vec())
    }

    fn output(type_url: &str) -> AnyOutput {
        AnyOutput {
            type_url: type_url.to_string(),
            value: transfers_payload(),
        }
    }

    fn lines(encoded: Encoded) -> Vec<serde_json::Value> {
        let Encoded::Bytes(bytes) = encoded else {
            panic!("json encoder produced rows");
        };
        std::str::from_utf8(&bytes)
            .expect("utf-8 output")
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid json line"))
            .collect()
    }

    #[test]
    fn whole_payload_is_one_line() {
        //* Given
        let encoder = JsonEncoder::new(transfers_descriptor(), None).expect("encoder");

        //* When
        let encoded = encoder
            .encode(&output("type.googleapis.com/erc20.v1.Transfers"))
            .expect("encode");

        //* Then
        let lines = lines(encoded);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["note"], "batch");
        assert_eq!(lines[0]["transfers"][1]["from"], "0xb");
    }

    #[test]
    fn rows_field_yields_one_line_per_element() {
        //* Given
        let encoder =
            JsonEncoder::new(transfers_descriptor(), Some("transfers")).expect("encoder");

        //* When
        let encoded = encoder.encode(&output("")).expect("encode");

        //* Then
        let lines = lines(encoded);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["from"], "0xa");
        assert_eq!(lines[1]["from"], "0xb");
        assert!(lines[0].get("note").is_none());
    }

    #[test]
    fn rows_field_must_be_a_repeated_message() {
        let result = JsonEncoder::new(transfers_descriptor(), Some("note"));

        let err = result.expect_err("scalar field");
        assert!(matches!(err, EncodeError::InvalidRowsField { .. }));
        assert_eq!(err.kind(), bundler::ErrorKind::Configuration);
    }

    #[test]
    fn other_message_types_are_rejected() {
        let encoder = JsonEncoder::new(transfers_descriptor(), None).expect("encoder");

        let result = encoder.encode(&output("type.googleapis.com/erc20.v1.Approvals"));

        let err = result.expect_err("type mismatch");
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));
        assert_eq!(err.kind(), bundler::ErrorKind::Data);
    }
}
