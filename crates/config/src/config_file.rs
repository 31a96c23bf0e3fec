//! TOML configuration file loading with environment variable overrides.
//!
//! ## Priority chain
//!
//! | Priority | Source | Mechanism |
//! |----------|--------|-----------|
//! | 1 (highest) | `SINK_CONFIG_*` env vars | `merge`, always wins |
//! | 2 | TOML file values | `merge`, base configuration |
//! | 3 (lowest) | serde defaults | missing keys only |
//!
//! ## Environment variables
//!
//! All env vars are prefixed with `SINK_CONFIG_` and use double underscores to separate nested
//! keys. For example, `SINK_CONFIG_UPLOAD__WORKERS` maps to `upload.workers`.
//!
//! ## Example
//!
//! ```toml
//! output_store = "s3://bucket/transfers"
//! file_block_count = 10000
//! encoder = "parquet"
//! proto_descriptor_set = "./erc20.binpb"
//! output_type = "erc20.v1.Transfers"
//!
//! [upload]
//! workers = 8
//!
//! [parquet]
//! compression = "zstd(3)"
//! column_types = { "erc20.v1.Transfer.amount" = "uint256" }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use parquet_rows::{ColumnType, SchemaOptions, TableMode};

use crate::{
    compression::Compression,
    duration::{ConfigDuration, deserialize_secs},
};

/// Prefix of the environment variables overriding the file.
pub const ENV_PREFIX: &str = "SINK_CONFIG_";

/// Default local directory for working files.
pub const DEFAULT_WORKING_DIR: &str = "./localdata/working";

/// Default location of the state file.
pub const DEFAULT_STATE_FILE: &str = "./state.yaml";

/// Default number of blocks per output file.
pub const DEFAULT_FILE_BLOCK_COUNT: u64 = 10_000;

/// Default amount of memory buffered per boundary before spilling to disk (64 MiB).
pub const DEFAULT_BUFFER_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Default date directory format.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Load a [`ConfigFile`] from a TOML file with env-var overrides.
///
/// See the [module-level docs](self) for the priority chain. A missing file is treated as
/// empty, which fails on the required `output_store` unless it is set from the environment.
pub fn load(config_path: &Path) -> Result<ConfigFile, LoadConfigFileError> {
    load_from(
        Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__")),
    )
}

/// Extracts and validates a [`ConfigFile`] from an assembled figment.
pub fn load_from(figment: Figment) -> Result<ConfigFile, LoadConfigFileError> {
    let config: ConfigFile = figment
        .extract()
        .map_err(|err| LoadConfigFileError(Box::new(err)))?;
    config.validate()?;

    tracing::debug!(
        output_store = %config.output_store,
        encoder = ?config.encoder,
        writer = ?config.writer,
        file_block_count = config.file_block_count,
        "configuration loaded"
    );
    Ok(config)
}

/// Raw configuration as deserialized from the TOML config file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConfigFile {
    /// Destination of the produced files, an object store URL or a local path.
    pub output_store: String,
    /// Local directory for working files (default: `./localdata/working`)
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// State file path (default: `./state.yaml`)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// First block to process when no state file exists (default: 0)
    #[serde(default)]
    pub start_block: u64,
    /// Exclusive block at which processing stops (default: none)
    #[serde(default)]
    pub stop_block: Option<u64>,
    /// Blocks per output file (default: 10000)
    #[serde(default = "default_file_block_count")]
    pub file_block_count: u64,

    /// How boundaries are accumulated for line encoders (default: `buffered`)
    #[serde(default)]
    pub writer: WriterKind,
    /// Bytes kept in memory before the buffered writer spills to disk (default: 64 MiB)
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: u64,
    /// Chunks queued to the drain task of the direct writer (default: 64)
    #[serde(default = "default_direct_channel_capacity")]
    pub direct_channel_capacity: usize,

    /// How block payloads become file content (default: `lines`)
    #[serde(default)]
    pub encoder: EncoderKind,
    /// Binary `FileDescriptorSet` describing the output type, required by `json` and `parquet`
    #[serde(default)]
    pub proto_descriptor_set: Option<PathBuf>,
    /// Fully-qualified name of the output message, required by `json` and `parquet`
    #[serde(default)]
    pub output_type: Option<String>,
    #[serde(default)]
    pub json: JsonConfig,

    #[serde(default)]
    pub date_partitioning: DatePartitioningConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    /// Time given to in-flight uploads at shutdown, in seconds (default: 30)
    #[serde(default)]
    pub shutdown_grace_period_secs: ConfigDuration<30>,
    #[serde(default)]
    pub parquet: ParquetConfig,
}

impl ConfigFile {
    fn validate(&self) -> Result<(), LoadConfigFileError> {
        let invalid = |msg: String| Err(LoadConfigFileError(Box::new(figment::Error::from(msg))));

        if self.output_store.trim().is_empty() {
            return invalid("output_store must not be empty".to_string());
        }
        if self.file_block_count == 0 {
            return invalid("file_block_count must be greater than zero".to_string());
        }
        if let Some(stop) = self.stop_block
            && stop <= self.start_block
        {
            return invalid(format!(
                "stop_block {stop} must be greater than start_block {}",
                self.start_block
            ));
        }
        if self.upload.max_attempts == 0 {
            return invalid("upload.max_attempts must be at least 1".to_string());
        }
        let max_backoff = self.upload.max_backoff_secs.get();
        if self.upload.min_backoff_secs > max_backoff {
            return invalid(format!(
                "upload.min_backoff_secs ({:?}) is above upload.max_backoff_secs ({max_backoff:?})",
                self.upload.min_backoff_secs
            ));
        }
        if self.encoder.needs_descriptor()
            && (self.proto_descriptor_set.is_none() || self.output_type.is_none())
        {
            return invalid(format!(
                "encoder {:?} requires proto_descriptor_set and output_type",
                self.encoder
            ));
        }
        Ok(())
    }
}

/// Accumulation strategy of byte-oriented boundaries.
///
/// The `parquet` encoder always uses the columnar writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterKind {
    /// In memory up to `buffer_max_size`, then a local working file.
    #[default]
    Buffered,
    /// Streamed into a working object in `working_dir` while the boundary is open.
    Direct,
    /// Entirely in memory.
    Memory,
    /// Nothing is written or uploaded.
    Noop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// Payload is a `Lines` message, each entry written as one line.
    #[default]
    Lines,
    /// Payload rendered as JSON lines.
    Json,
    /// Payload flattened into Parquet tables.
    Parquet,
}

impl EncoderKind {
    pub fn needs_descriptor(&self) -> bool {
        matches!(self, EncoderKind::Json | EncoderKind::Parquet)
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct JsonConfig {
    /// Repeated field of the output message written one element per line; the whole message
    /// is one line when unset
    #[serde(default)]
    pub rows_field: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DatePartitioningConfig {
    /// Close boundaries on UTC date changes and upload under date directories (default: false)
    #[serde(default)]
    pub enabled: bool,
    /// strftime format of the date directory (default: `%Y-%m-%d`)
    #[serde(default = "default_date_format")]
    pub format: String,
}

impl Default for DatePartitioningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: default_date_format(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UploadConfig {
    /// Concurrent uploads (default: 5)
    #[serde(default = "default_upload_workers")]
    pub workers: usize,
    /// Attempts per upload, the first one included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// First retry delay in seconds (default: 0.5)
    #[serde(
        default = "default_min_backoff",
        deserialize_with = "deserialize_min_backoff"
    )]
    pub min_backoff_secs: Duration,
    /// Retry delay cap in seconds (default: 30)
    #[serde(default)]
    pub max_backoff_secs: ConfigDuration<30>,
    /// Closed boundaries waiting for a worker (default: 64)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: default_upload_workers(),
            max_attempts: default_max_attempts(),
            min_backoff_secs: default_min_backoff(),
            max_backoff_secs: ConfigDuration::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ParquetConfig {
    /// Compression codec (default: `zstd(1)`)
    #[serde(default)]
    pub compression: Compression,
    /// Table derivation when `tables` is empty (default: `auto`)
    #[serde(default)]
    pub table_mode: TableMode,
    /// Explicit tables, message full name to table name
    #[serde(default)]
    pub tables: BTreeMap<String, String>,
    /// Field full names left out of every table
    #[serde(default)]
    pub ignored_fields: Vec<String>,
    /// Field full names stored as `int256` or `uint256`
    #[serde(default)]
    pub column_types: HashMap<String, ColumnType>,
    /// Rows per row group (default: 1000000)
    #[serde(default = "default_max_row_group_rows")]
    pub max_row_group_rows: usize,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            table_mode: TableMode::default(),
            tables: BTreeMap::new(),
            ignored_fields: Vec::new(),
            column_types: HashMap::new(),
            max_row_group_rows: default_max_row_group_rows(),
        }
    }
}

impl ParquetConfig {
    /// Schema derivation overrides described by this section.
    pub fn schema_options(&self) -> SchemaOptions {
        SchemaOptions {
            mode: self.table_mode,
            tables: self.tables.clone(),
            ignored_fields: self.ignored_fields.iter().cloned().collect(),
            column_types: self.column_types.clone(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    DEFAULT_WORKING_DIR.into()
}

fn default_state_file() -> PathBuf {
    DEFAULT_STATE_FILE.into()
}

fn default_file_block_count() -> u64 {
    DEFAULT_FILE_BLOCK_COUNT
}

fn default_buffer_max_size() -> u64 {
    DEFAULT_BUFFER_MAX_SIZE
}

fn default_direct_channel_capacity() -> usize {
    64
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.into()
}

fn default_upload_workers() -> usize {
    5
}

fn default_max_attempts() -> usize {
    3
}

fn default_min_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_row_group_rows() -> usize {
    1_000_000
}

fn deserialize_min_backoff<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_secs(deserializer).map(|secs| secs.unwrap_or_else(default_min_backoff))
}

/// Error when loading configuration from a TOML file.
///
/// Covers unreadable TOML, values of the wrong type and values failing validation.
#[derive(Debug, thiserror::Error)]
#[error("Failed to load configuration file")]
pub struct LoadConfigFileError(#[source] pub Box<figment::Error>);
