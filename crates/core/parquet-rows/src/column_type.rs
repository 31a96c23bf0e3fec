//! Column type overrides for fields whose protobuf kind does not carry enough information.
//!
//! Protobuf has no 256-bit integer, producers encode those as decimal or `0x` hex strings. A
//! field marked with a [`ColumnType`] is stored as a 32-byte big-endian fixed-length column
//! annotated `DECIMAL(76, 0)`.

use std::str::FromStr;

use alloy_primitives::{I256, Sign, U256};

/// Width in bytes of a 256-bit column value.
pub const FIXED_256_LEN: usize = 32;

/// Decimal precision advertised for 256-bit columns, the largest one 32 bytes can hold.
pub const FIXED_256_PRECISION: i32 = 76;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Signed 256-bit integer, two's complement.
    Int256,
    /// Unsigned 256-bit integer.
    Uint256,
}

impl ColumnType {
    /// Parses `literal` and returns its 32-byte big-endian representation.
    ///
    /// Accepts decimal digits or a `0x` prefixed hex string, with an optional leading `-` for
    /// [`ColumnType::Int256`].
    pub fn parse_literal(&self, literal: &str) -> Result<[u8; FIXED_256_LEN], String> {
        let literal = literal.trim();
        match self {
            ColumnType::Uint256 => {
                if literal.starts_with('-') {
                    return Err("negative value for an unsigned column".to_string());
                }
                let value = parse_magnitude(literal)?;
                Ok(value.to_be_bytes::<FIXED_256_LEN>())
            }
            ColumnType::Int256 => {
                let (sign, digits) = match literal.strip_prefix('-') {
                    Some(digits) => (Sign::Negative, digits),
                    None => (Sign::Positive, literal),
                };
                signed_bytes(sign, parse_magnitude(digits)?)
            }
        }
    }

    /// Encodes a native signed integer.
    pub fn from_i64(&self, value: i64) -> Result<[u8; FIXED_256_LEN], String> {
        match self {
            ColumnType::Uint256 if value < 0 => {
                Err("negative value for an unsigned column".to_string())
            }
            ColumnType::Uint256 => Ok(U256::from(value as u64).to_be_bytes::<FIXED_256_LEN>()),
            ColumnType::Int256 => {
                let sign = if value < 0 {
                    Sign::Negative
                } else {
                    Sign::Positive
                };
                signed_bytes(sign, U256::from(value.unsigned_abs()))
            }
        }
    }

    /// Encodes a native unsigned integer.
    pub fn from_u64(&self, value: u64) -> Result<[u8; FIXED_256_LEN], String> {
        match self {
            ColumnType::Uint256 => Ok(U256::from(value).to_be_bytes::<FIXED_256_LEN>()),
            ColumnType::Int256 => signed_bytes(Sign::Positive, U256::from(value)),
        }
    }
}

fn signed_bytes(sign: Sign, magnitude: U256) -> Result<[u8; FIXED_256_LEN], String> {
    I256::checked_from_sign_and_abs(sign, magnitude)
        .map(|value| value.to_be_bytes::<FIXED_256_LEN>())
        .ok_or_else(|| "number does not fit in 256 bits".to_string())
}

fn parse_magnitude(digits: &str) -> Result<U256, String> {
    if digits.is_empty() {
        return Err("empty number".to_string());
    }

    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some("") => return Err("missing hex digits".to_string()),
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(digits, 10),
    };

    parsed.map_err(|err| err.to_string())
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Int256 => f.write_str("int256"),
            ColumnType::Uint256 => f.write_str("uint256"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int256" => Ok(ColumnType::Int256),
            "uint256" => Ok(ColumnType::Uint256),
            other => Err(format!(
                "invalid column type {other:?}, accepted column types are [int256, uint256]"
            )),
        }
    }
}
