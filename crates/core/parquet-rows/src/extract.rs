use std::collections::{BTreeMap, HashMap};

use prost_reflect::{DynamicMessage, FieldDescriptor, MessageDescriptor, ReflectMessage, Value};

use crate::{
    encode::encode_message,
    error::RowError,
    row::Row,
    schema::{TableSchema, TableSet},
};

/// Rows of one payload, grouped by table name.
///
/// Every table of the set has an entry, possibly empty.
pub type RowsByTable = BTreeMap<String, Vec<Row>>;

/// Where the rows of each table come from inside an output message.
#[derive(Debug, Clone)]
pub enum RowExtractor {
    /// The whole message is one row.
    Root { table: String },
    /// Each element of a single repeated message field is one row.
    RowList {
        table: String,
        field: FieldDescriptor,
    },
    /// Each element of each listed repeated field is one row of the paired table.
    RepeatedFields {
        fields: Vec<(String, FieldDescriptor)>,
    },
    /// Every occurrence of a configured message, at any depth, is one row of its table.
    Tables { by_message: HashMap<String, String> },
}

impl TableSet {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|table| table.name() == name)
    }

    /// Decodes an encoded `root` message and extracts its rows.
    pub fn decode_rows(
        &self,
        root: &MessageDescriptor,
        payload: &[u8],
    ) -> Result<RowsByTable, RowError> {
        let message =
            DynamicMessage::decode(root.clone(), payload).map_err(|source| RowError::Decode {
                message: root.full_name().to_string(),
                source,
            })?;
        self.rows(&message)
    }

    /// Extracts the rows of every table from a decoded output message.
    ///
    /// All or nothing: an error in any row discards the rows of every table.
    pub fn rows(&self, message: &DynamicMessage) -> Result<RowsByTable, RowError> {
        let mut out: RowsByTable = self
            .tables
            .iter()
            .map(|table| (table.name().to_string(), Vec::new()))
            .collect();

        match &self.extractor {
            RowExtractor::Root { table } => {
                let schema = self.lookup(table)?;
                push(&mut out, table, encode_message(schema, message)?);
            }
            RowExtractor::RowList { table, field } => {
                self.list_rows(&mut out, table, field, message)?;
            }
            RowExtractor::RepeatedFields { fields } => {
                for (table, field) in fields {
                    self.list_rows(&mut out, table, field, message)?;
                }
            }
            RowExtractor::Tables { by_message } => {
                self.walk(&mut out, by_message, message)?;
            }
        }

        Ok(out)
    }

    fn list_rows(
        &self,
        out: &mut RowsByTable,
        table: &str,
        field: &FieldDescriptor,
        message: &DynamicMessage,
    ) -> Result<(), RowError> {
        let schema = self.lookup(table)?;
        let value = message.get_field(field);
        let Some(elements) = value.as_list() else {
            return Err(RowError::UnexpectedValue {
                field: field.full_name().to_string(),
                expected: "a list",
            });
        };

        for element in elements {
            let Some(element) = element.as_message() else {
                return Err(RowError::UnexpectedValue {
                    field: field.full_name().to_string(),
                    expected: "a message",
                });
            };
            push(out, table, encode_message(schema, element)?);
        }

        Ok(())
    }

    fn walk(
        &self,
        out: &mut RowsByTable,
        by_message: &HashMap<String, String>,
        message: &DynamicMessage,
    ) -> Result<(), RowError> {
        if let Some(table) = by_message.get(message.descriptor().full_name()) {
            let schema = self.lookup(table)?;
            push(out, table, encode_message(schema, message)?);
        }

        for (_, value) in message.fields() {
            match value {
                Value::Message(nested) => self.walk(out, by_message, nested)?,
                Value::List(elements) => {
                    for element in elements {
                        if let Value::Message(nested) = element {
                            self.walk(out, by_message, nested)?;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn lookup(&self, table: &str) -> Result<&TableSchema, RowError> {
        self.table(table).ok_or_else(|| RowError::UnexpectedValue {
            field: table.to_string(),
            expected: "a derived table",
        })
    }
}

fn push(out: &mut RowsByTable, table: &str, row: Row) {
    out.entry(table.to_string()).or_default().push(row);
}
