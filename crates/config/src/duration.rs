use std::time::Duration;

use serde::Deserialize as _;

/// Duration in seconds with a compile-time default.
///
/// Deserializes from an optional floating-point number of seconds. When the value is absent or
/// `null`, the compile-time `DEFAULT_SECS` is used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigDuration<const DEFAULT_SECS: u64>(Duration);

impl<const DEFAULT_SECS: u64> ConfigDuration<DEFAULT_SECS> {
    pub fn get(&self) -> Duration {
        self.0
    }
}

impl<const DEFAULT_SECS: u64> Default for ConfigDuration<DEFAULT_SECS> {
    fn default() -> Self {
        Self(Duration::from_secs(DEFAULT_SECS))
    }
}

impl<const DEFAULT_SECS: u64> From<ConfigDuration<DEFAULT_SECS>> for Duration {
    fn from(val: ConfigDuration<DEFAULT_SECS>) -> Self {
        val.0
    }
}

impl<'de, const DEFAULT_SECS: u64> serde::Deserialize<'de> for ConfigDuration<DEFAULT_SECS> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserialize_secs(deserializer).map(|opt| opt.map_or_else(Self::default, Self))
    }
}

/// Deserializes an optional number of seconds, rejecting negative and non-finite values.
pub(crate) fn deserialize_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<f64>>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .transpose()
}
