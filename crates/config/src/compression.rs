use std::{fmt, str::FromStr};

use parquet::basic;

/// Parquet compression codec of the produced files.
///
/// Parsed from a case-insensitive string:
///
/// | Input          | Result                                  |
/// |----------------|-----------------------------------------|
/// | `zstd`         | Zstandard at the default level (1)      |
/// | `zstd(N)`      | Zstandard at level N (1–22)             |
/// | `lz4`          | LZ4 raw                                 |
/// | `gzip`         | Gzip at the parquet-default level       |
/// | `brotli`       | Brotli at the parquet-default level     |
/// | `snappy`       | Snappy                                  |
/// | `uncompressed` | No compression                          |
///
/// Default: `zstd(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd(ZstdLevel),
    Lz4,
    Gzip,
    Brotli,
    Snappy,
    Uncompressed,
}

/// Zstandard compression level, validated against parquet's accepted range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZstdLevel(basic::ZstdLevel);

impl ZstdLevel {
    pub fn try_new(level: i32) -> Result<Self, String> {
        basic::ZstdLevel::try_new(level)
            .map(Self)
            .map_err(|err| format!("invalid zstd level: {err}"))
    }

    pub fn compression_level(self) -> i32 {
        self.0.compression_level()
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::Zstd(ZstdLevel::default())
    }
}

impl<'de> serde::Deserialize<'de> for Compression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for Compression {
    // Only consumed through `serde::de::Error::custom`
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "lz4" => Ok(Self::Lz4),
            "gzip" => Ok(Self::Gzip),
            "brotli" => Ok(Self::Brotli),
            "snappy" => Ok(Self::Snappy),
            "uncompressed" => Ok(Self::Uncompressed),
            "zstd" => Ok(Self::Zstd(ZstdLevel::default())),
            s if s.starts_with("zstd(") => {
                let inner = s
                    .strip_prefix("zstd(")
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| format!("invalid compression: {s}"))?;
                let raw: i32 = inner
                    .parse()
                    .map_err(|_| format!("invalid zstd level: {inner}"))?;
                Ok(Self::Zstd(ZstdLevel::try_new(raw)?))
            }
            _ => Err(format!(
                "unknown compression algorithm: {s}. \
                 Supported: zstd(N), lz4, gzip, brotli, snappy, uncompressed"
            )),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zstd(level) => write!(f, "zstd({})", level.compression_level()),
            Self::Lz4 => f.write_str("lz4"),
            Self::Gzip => f.write_str("gzip"),
            Self::Brotli => f.write_str("brotli"),
            Self::Snappy => f.write_str("snappy"),
            Self::Uncompressed => f.write_str("uncompressed"),
        }
    }
}

impl From<Compression> for basic::Compression {
    fn from(c: Compression) -> Self {
        match c {
            Compression::Zstd(level) => basic::Compression::ZSTD(level.0),
            Compression::Lz4 => basic::Compression::LZ4_RAW,
            Compression::Gzip => basic::Compression::GZIP(basic::GzipLevel::default()),
            Compression::Brotli => basic::Compression::BROTLI(basic::BrotliLevel::default()),
            Compression::Snappy => basic::Compression::SNAPPY,
            Compression::Uncompressed => basic::Compression::UNCOMPRESSED,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_every_codec() {
        for (input, expected) in [
            ("zstd", "zstd(1)"),
            ("ZSTD(3)", "zstd(3)"),
            ("lz4", "lz4"),
            ("gzip", "gzip"),
            ("brotli", "brotli"),
            (" snappy ", "snappy"),
            ("uncompressed", "uncompressed"),
        ] {
            let parsed: Compression = input.parse().expect(input);
            assert_eq!(parsed.to_string(), expected);
        }
    }

    #[test]
    fn default_is_zstd_level_one() {
        assert_eq!(
            basic::Compression::from(Compression::default()),
            basic::Compression::ZSTD(basic::ZstdLevel::default())
        );
        assert_eq!(Compression::default().to_string(), "zstd(1)");
    }

    #[test]
    fn unknown_codec_names_the_accepted_values() {
        let err = "lzo".parse::<Compression>().expect_err("unsupported");

        assert!(err.contains("Supported: zstd(N), lz4, gzip, brotli, snappy, uncompressed"));
    }

    #[test]
    fn out_of_range_zstd_level_is_rejected() {
        assert!("zstd(99)".parse::<Compression>().is_err());
        assert!("zstd(x)".parse::<Compression>().is_err());
    }
}
