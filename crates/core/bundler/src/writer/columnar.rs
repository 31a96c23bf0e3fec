use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use parquet::{
    basic::Compression,
    file::properties::{WriterProperties, WriterPropertiesPtr},
};
use parquet_rows::{ParquetFileBuilder, RowsByTable, TableSchema};

use super::{FileType, Writer, check_close};
use crate::{
    error::WriterError,
    range::BlockRange,
    uploadable::{MemoryUpload, UploadSet, Uploadable},
};

#[derive(Debug, Clone)]
pub struct ParquetWriterOptions {
    pub compression: Compression,
    pub max_row_group_rows: usize,
}

impl Default for ParquetWriterOptions {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
            max_row_group_rows: 1_000_000,
        }
    }
}

/// Buffers rows per table and writes one Parquet file per table at close.
///
/// Files land at `{table}/{start:010}-{end:010}.parquet` and upload concurrently.
pub struct ParquetWriter {
    tables: Vec<TableSchema>,
    properties: WriterPropertiesPtr,
    max_row_group_rows: usize,
    active: Option<Boundary>,
}

struct Boundary {
    range: BlockRange,
    builders: BTreeMap<String, ParquetFileBuilder>,
}

impl ParquetWriter {
    pub fn new(tables: Vec<TableSchema>, options: ParquetWriterOptions) -> Self {
        let properties = WriterProperties::builder()
            .set_compression(options.compression)
            .set_created_by(concat!("files-sink ", env!("CARGO_PKG_VERSION")).to_string())
            .build();

        Self {
            tables,
            properties: Arc::new(properties),
            max_row_group_rows: options.max_row_group_rows,
            active: None,
        }
    }
}

#[async_trait]
impl Writer for ParquetWriter {
    fn file_type(&self) -> FileType {
        FileType::Parquet
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        if let Some(active) = &self.active {
            return Err(WriterError::AlreadyActive {
                active: active.range,
            });
        }

        let builders = self
            .tables
            .iter()
            .map(|table| {
                ParquetFileBuilder::new(
                    table,
                    Arc::clone(&self.properties),
                    self.max_row_group_rows,
                )
                .map(|builder| (table.name().to_string(), builder))
            })
            .collect::<Result<_, _>>()
            .map_err(WriterError::Rows)?;

        self.active = Some(Boundary { range, builders });
        Ok(())
    }

    async fn write(&mut self, _data: Bytes) -> Result<(), WriterError> {
        Err(WriterError::UnsupportedInput {
            file_type: FileType::Parquet,
            input: "raw bytes",
        })
    }

    async fn write_rows(&mut self, rows: RowsByTable) -> Result<(), WriterError> {
        let boundary = self.active.as_mut().ok_or(WriterError::NoActiveBoundary)?;

        if let Some(table) = rows.keys().find(|table| !boundary.builders.contains_key(*table)) {
            return Err(WriterError::UnknownTable {
                table: table.clone(),
            });
        }

        for (table, rows) in rows {
            let Some(builder) = boundary.builders.get_mut(&table) else {
                continue;
            };
            for row in rows {
                builder.push(row).map_err(WriterError::Rows)?;
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(range = %range), err)]
    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let active = self.active.as_ref().ok_or(WriterError::NoActiveBoundary)?;
        check_close(active.range, range)?;
        let boundary = self.active.take().ok_or(WriterError::NoActiveBoundary)?;

        let file_name = range.file_name(FileType::Parquet.extension());
        let mut parts: Vec<Box<dyn Uploadable>> = Vec::with_capacity(boundary.builders.len());
        for (table, builder) in boundary.builders {
            let rows = builder.num_rows();
            let data = builder.finish().map_err(WriterError::Rows)?;
            tracing::debug!(table = %table, rows, size = data.len(), "table file finished");

            let path = Path::from_iter([table.as_str(), file_name.as_str()]);
            parts.push(Box::new(MemoryUpload::new(path, data)));
        }

        Ok(Box::new(UploadSet::new(parts)))
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        self.active
            .take()
            .map(|_| ())
            .ok_or(WriterError::NoActiveBoundary)
    }
}

#[cfg(test)]
mod test {
    use object_store::{ObjectStore, memory::InMemory};
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use parquet_rows::{SchemaOptions, TableMode, derive_tables};
    use prost_reflect::{DescriptorPool, DynamicMessage, Value};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        field_descriptor_proto::{Label, Type},
    };

    use super::*;

    fn pool() -> DescriptorPool {
        let field = |name: &str, number: i32, ty: Type, label: Label, type_name: Option<&str>| {
            FieldDescriptorProto {
                name: Some(name.to_string()),
                json_name: Some(name.to_string()),
                number: Some(number),
                r#type: Some(ty as i32),
                label: Some(label as i32),
                type_name: type_name.map(str::to_string),
                ..Default::default()
            }
        };
        let file = FileDescriptorProto {
            name: Some("erc20.proto".to_string()),
            package: Some("erc20.v1".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("Transfer".to_string()),
                    field: vec![
                        field("from", 1, Type::String, Label::Optional, None),
                        field("amount", 2, Type::Uint64, Label::Optional, None),
                    ],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("Transfers".to_string()),
                    field: vec![field(
                        "transfers",
                        1,
                        Type::Message,
                        Label::Repeated,
                        Some(".erc20.v1.Transfer"),
                    )],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
            .expect("valid descriptors")
    }

    #[tokio::test]
    async fn writes_one_file_per_table() {
        //* Given
        let pool = pool();
        let root = pool.get_message_by_name("erc20.v1.Transfers").unwrap();
        let options = SchemaOptions {
            mode: TableMode::RowList,
            ..Default::default()
        };
        let set = derive_tables(&root, &options).expect("derive tables");
        let mut writer = ParquetWriter::new(set.tables.clone(), ParquetWriterOptions::default());
        let range = BlockRange::new(0, 100);
        writer.start_boundary(range).await.expect("start");

        let transfer = |from: &str| {
            let mut message = DynamicMessage::new(pool.get_message_by_name("erc20.v1.Transfer").unwrap());
            message.set_field_by_name("from", Value::String(from.to_string()));
            message.set_field_by_name("amount", Value::U64(10));
            Value::Message(message)
        };
        let mut message = DynamicMessage::new(root);
        message.set_field_by_name("transfers", Value::List(vec![transfer("a"), transfer("b")]));

        //* When
        writer
            .write_rows(set.rows(&message).expect("rows"))
            .await
            .expect("write rows");
        let artifact = writer.close_boundary(range).await.expect("close");

        //* Then
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let paths = artifact.upload(&store).await.expect("upload");
        assert_eq!(paths, [Path::from("transfers/0000000000-0000000100.parquet")]);

        let bytes = store.get(&paths[0]).await.unwrap().bytes().await.unwrap();
        let reader = SerializedFileReader::new(bytes).expect("parquet file");
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }

    #[tokio::test]
    async fn rejects_raw_bytes_and_unknown_tables() {
        let mut writer = ParquetWriter::new(Vec::new(), ParquetWriterOptions::default());
        writer
            .start_boundary(BlockRange::new(0, 10))
            .await
            .expect("start");

        assert!(matches!(
            writer.write(Bytes::from_static(b"x")).await,
            Err(WriterError::UnsupportedInput { .. })
        ));

        let mut rows = RowsByTable::new();
        rows.insert("nope".to_string(), Vec::new());
        assert!(matches!(
            writer.write_rows(rows).await,
            Err(WriterError::UnknownTable { .. })
        ));
    }
}
