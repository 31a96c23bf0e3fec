//! Assembly of a [`Sinker`] from the configuration file.

use std::path::Path;

use bundler::{
    Bundler, BundlerError, FileType, StateStore, UploadQueue, UploadQueueConfig, Writer,
    writer::{
        BufferedWriter, DatePartitionedWriter, DirectWriter, MemWriter, MeteredWriter,
        NoopWriter, ParquetWriter, ParquetWriterOptions,
    },
};
use fs_err as fs;
use parquet_rows::derive_tables;
use prost_reflect::{DescriptorPool, MessageDescriptor};
use sink_config::{ConfigFile, EncoderKind, WriterKind};
use sink_object_store::url::ObjectStoreUrl;

use crate::{
    encoder::{Encoder, JsonEncoder, LinesEncoder, ParquetEncoder},
    error::{EncodeError, SinkError},
    sinker::Sinker,
};

/// Builds a ready to run sinker.
///
/// Every configuration problem surfaces here, before the source is contacted: unreachable
/// store locations, unreadable descriptors, unknown output types and tables that cannot be
/// derived.
#[tracing::instrument(skip_all, err)]
pub async fn build(config: &ConfigFile) -> Result<Sinker, SinkError> {
    let output_url =
        ObjectStoreUrl::new(config.output_store.as_str()).map_err(SinkError::StoreUrl)?;
    let output_store = sink_object_store::new(&output_url)?;

    let (encoder, writer) = pipeline(config).await?;

    let writer = if config.date_partitioning.enabled {
        let partitioned = DatePartitionedWriter::new(writer, config.date_partitioning.format.as_str())
            .map_err(BundlerError::from)?;
        Box::new(partitioned) as Box<dyn Writer>
    } else {
        writer
    };
    let writer = Box::new(MeteredWriter::new(writer));

    let bundler = Bundler::new(
        config.file_block_count,
        writer,
        config.date_partitioning.enabled,
    )?;

    let (state, resume) = StateStore::open(&config.state_file).map_err(BundlerError::from)?;
    let queue = UploadQueue::new(output_store, state, upload_queue_config(config));

    tracing::info!(
        output_store = %output_url,
        encoder = ?config.encoder,
        writer = ?config.writer,
        file_type = %bundler.file_type(),
        file_block_count = config.file_block_count,
        date_partitioning = config.date_partitioning.enabled,
        state_file = %config.state_file.display(),
        "sink configured"
    );

    Ok(Sinker::new(
        bundler,
        queue,
        encoder,
        resume,
        config.start_block,
        config.stop_block,
    ))
}

pub fn upload_queue_config(config: &ConfigFile) -> UploadQueueConfig {
    UploadQueueConfig {
        workers: config.upload.workers,
        capacity: config.upload.queue_capacity,
        max_attempts: config.upload.max_attempts,
        min_backoff: config.upload.min_backoff_secs,
        max_backoff: config.upload.max_backoff_secs.get(),
        grace_period: config.shutdown_grace_period_secs.get(),
    }
}

/// The encoder and the matching base writer.
async fn pipeline(config: &ConfigFile) -> Result<(Box<dyn Encoder>, Box<dyn Writer>), SinkError> {
    match config.encoder {
        EncoderKind::Lines => Ok((
            Box::new(LinesEncoder),
            byte_writer(config, FileType::Jsonl).await?,
        )),
        EncoderKind::Json => {
            let message = output_message(config)?;
            let encoder = JsonEncoder::new(message, config.json.rows_field.as_deref())?;
            Ok((
                Box::new(encoder),
                byte_writer(config, FileType::Jsonl).await?,
            ))
        }
        EncoderKind::Parquet => {
            let message = output_message(config)?;
            let tables = derive_tables(&message, &config.parquet.schema_options())
                .map_err(EncodeError::Schema)?;
            tracing::info!(
                message = message.full_name(),
                tables = ?tables.tables.iter().map(|table| table.name()).collect::<Vec<_>>(),
                "parquet tables derived"
            );

            let writer = ParquetWriter::new(
                tables.tables.clone(),
                ParquetWriterOptions {
                    compression: config.parquet.compression.into(),
                    max_row_group_rows: config.parquet.max_row_group_rows,
                },
            );
            Ok((
                Box::new(ParquetEncoder::new(message, tables)),
                Box::new(writer),
            ))
        }
    }
}

async fn byte_writer(config: &ConfigFile, file_type: FileType) -> Result<Box<dyn Writer>, SinkError> {
    let writer: Box<dyn Writer> = match config.writer {
        WriterKind::Buffered => {
            fs::tokio::create_dir_all(&config.working_dir)
                .await
                .map_err(|source| SinkError::WorkingDir {
                    path: config.working_dir.clone(),
                    source,
                })?;
            let max_size = usize::try_from(config.buffer_max_size).unwrap_or(usize::MAX);
            Box::new(BufferedWriter::new(file_type, &config.working_dir, max_size))
        }
        WriterKind::Direct => {
            let url = ObjectStoreUrl::new(config.working_dir.to_string_lossy())
                .map_err(SinkError::StoreUrl)?;
            let working_store = sink_object_store::new(&url)?;
            Box::new(DirectWriter::new(
                file_type,
                working_store,
                config.direct_channel_capacity,
            ))
        }
        WriterKind::Memory => Box::new(MemWriter::new(file_type)),
        WriterKind::Noop => Box::new(NoopWriter::new(file_type)),
    };
    Ok(writer)
}

fn output_message(config: &ConfigFile) -> Result<MessageDescriptor, SinkError> {
    let path = config
        .proto_descriptor_set
        .as_deref()
        .ok_or(SinkError::MissingSetting("proto_descriptor_set"))?;
    let name = config
        .output_type
        .as_deref()
        .ok_or(SinkError::MissingSetting("output_type"))?;

    let pool = load_descriptor_pool(path)?;
    pool.get_message_by_name(name)
        .ok_or_else(|| EncodeError::UnknownMessage {
            name: name.to_string(),
        })
        .map_err(Into::into)
}

/// Reads a serialized `FileDescriptorSet`.
pub fn load_descriptor_pool(path: &Path) -> Result<DescriptorPool, SinkError> {
    let bytes = fs::read(path).map_err(|source| SinkError::ReadDescriptorSet {
        path: path.to_path_buf(),
        source,
    })?;
    DescriptorPool::decode(bytes.as_slice()).map_err(|source| SinkError::DecodeDescriptorSet {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod test {
    use std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    };

    use bytes::Bytes;
    use figment::{Figment, providers::{Format as _, Toml}};
    use futures::stream::{self, StreamExt as _};
    use parquet::file::reader::{FileReader as _, SerializedFileReader};
    use prost::Message as _;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        encoder::{Lines, test_descriptors},
        source::{AnyOutput, BlockScopedData, Clock, SourceEvent, SourceStream, StreamRequest},
    };

    struct Workspace {
        dir: tempfile::TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let descriptors = test_descriptors::file_descriptor_set().encode_to_vec();
            std::fs::write(dir.path().join("erc20.binpb"), descriptors).expect("write descriptors");
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn config(&self, extra: &str) -> ConfigFile {
            let base = format!(
                r#"
                output_store = "{out}"
                working_dir = "{working}"
                state_file = "{state}"
                proto_descriptor_set = "{descriptors}"
                file_block_count = 10
                "#,
                out = self.path("out").display(),
                working = self.path("working").display(),
                state = self.path("state.yaml").display(),
                descriptors = self.path("erc20.binpb").display(),
            );
            sink_config::load_from(
                Figment::new()
                    .merge(Toml::string(&base))
                    .merge(Toml::string(extra)),
            )
            .expect("valid config")
        }
    }

    fn block(number: u64, type_url: &str, value: Bytes) -> Result<SourceEvent, crate::SourceError> {
        Ok(SourceEvent::Data(BlockScopedData {
            cursor: format!("cursor-{number}"),
            clock: Clock {
                id: format!("0x{number:x}"),
                number,
                timestamp: None,
            },
            output: AnyOutput {
                type_url: type_url.to_string(),
                value,
            },
        }))
    }

    fn replay(
        events: Vec<Result<SourceEvent, crate::SourceError>>,
    ) -> impl Fn(StreamRequest) -> SourceStream {
        let events = Arc::new(Mutex::new(Some(events)));
        move |_request| {
            let events = events.lock().unwrap().take().unwrap_or_default();
            stream::iter(events).boxed()
        }
    }

    #[tokio::test]
    async fn lines_through_the_buffered_writer() {
        //* Given
        let workspace = Workspace::new();
        let config = workspace.config("");
        let lines = |text: &str| {
            Bytes::from(
                Lines {
                    lines: vec![text.as_bytes().to_vec()],
                }
                .encode_to_vec(),
            )
        };
        let source = replay(vec![
            block(2, "", lines("a")),
            block(9, "", lines("b")),
            block(10, "", lines("c")),
        ]);

        //* When
        let sinker = build(&config).await.expect("build");
        let summary = sinker
            .run(&source, CancellationToken::new())
            .await
            .expect("run");

        //* Then
        assert_eq!(summary.boundaries, 2);
        let first = std::fs::read_to_string(workspace.path("out/0000000000-0000000010.jsonl"))
            .expect("first file");
        assert_eq!(first, "a\nb\n");
        let second = std::fs::read_to_string(workspace.path("out/0000000010-0000000011.jsonl"))
            .expect("second file");
        assert_eq!(second, "c\n");
        assert!(workspace.path("state.yaml").exists());
    }

    #[tokio::test]
    async fn parquet_tables_land_in_their_own_directory() {
        //* Given
        let workspace = Workspace::new();
        let config = workspace.config(
            r#"
            encoder = "parquet"
            writer = "memory"
            output_type = "erc20.v1.Transfers"
            "#,
        );
        let type_url = "type.googleapis.com/erc20.v1.Transfers";
        let source = replay(vec![
            block(1, type_url, test_descriptors::transfers_payload(2)),
            block(2, type_url, test_descriptors::transfers_payload(3)),
        ]);

        //* When
        let sinker = build(&config).await.expect("build");
        sinker
            .run(&source, CancellationToken::new())
            .await
            .expect("run");

        //* Then
        let file = std::fs::File::open(
            workspace.path("out/transfers/0000000000-0000000003.parquet"),
        )
        .expect("parquet file");
        let reader = SerializedFileReader::new(file).expect("parquet reader");
        assert_eq!(reader.metadata().file_metadata().num_rows(), 5);
    }

    #[tokio::test]
    async fn unknown_output_type_fails_before_running() {
        //* Given
        let workspace = Workspace::new();
        let config = workspace.config(
            r#"
            encoder = "json"
            output_type = "erc20.v1.Approvals"
            "#,
        );

        //* When
        let result = build(&config).await;

        //* Then
        let err = result.err().expect("unknown message");
        assert!(matches!(
            err,
            SinkError::Encode(EncodeError::UnknownMessage { ref name }) if name == "erc20.v1.Approvals"
        ));
        assert_eq!(err.kind(), bundler::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn unreadable_descriptor_set_is_a_configuration_error() {
        let workspace = Workspace::new();
        std::fs::write(workspace.path("erc20.binpb"), b"\x0a\xff").expect("overwrite");
        let config = workspace.config(
            r#"
            encoder = "json"
            output_type = "erc20.v1.Transfers"
            "#,
        );

        let result = build(&config).await;

        let err = result.err().expect("invalid descriptors");
        assert!(matches!(err, SinkError::DecodeDescriptorSet { .. }));
        assert_eq!(err.kind(), bundler::ErrorKind::Configuration);
    }
}
