//! Configuration of the files sink.
//!
//! The configuration is a TOML file deserialized into a [`ConfigFile`] with [figment], every
//! key overridable through `SINK_CONFIG_*` environment variables. See [`config_file`] for the
//! loading rules and the defaults.

pub mod compression;
pub mod config_file;
pub mod duration;

pub use self::{
    compression::{Compression, ZstdLevel},
    config_file::{
        ConfigFile, DatePartitioningConfig, EncoderKind, JsonConfig, LoadConfigFileError,
        ParquetConfig, UploadConfig, WriterKind, load, load_from,
    },
    duration::ConfigDuration,
};
