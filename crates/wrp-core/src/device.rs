//! `DeviceId`: the canonical `scheme:value` device identifier used as a key
//! in outgoing headers and destination matching.

use std::fmt;
use std::str::FromStr;

/// The set of identifier schemes the cloud recognizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeviceScheme {
    Mac,
    Uuid,
    Dns,
    Serial,
}

impl DeviceScheme {
    fn as_str(self) -> &'static str {
        match self {
            DeviceScheme::Mac => "mac",
            DeviceScheme::Uuid => "uuid",
            DeviceScheme::Dns => "dns",
            DeviceScheme::Serial => "serial",
        }
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum DeviceIdError {
    #[error("device id {0:?} is missing a ':' scheme separator")]
    MissingSeparator(String),
    #[error("device id scheme {0:?} is not one of mac/uuid/dns/serial")]
    UnknownScheme(String),
    #[error("device id value is empty")]
    EmptyValue,
}

/// Canonical, case-normalized device identifier: `scheme:value`.
///
/// Normalization rules: the scheme
/// is always lower-cased; a `mac` value is lower-cased with `:`-joined
/// octets; a `uuid` value is lower-cased; `dns`/`serial` values are used
/// verbatim apart from trimming surrounding whitespace.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceId {
    scheme: DeviceScheme,
    value: String,
}

impl DeviceId {
    pub fn scheme(&self) -> DeviceScheme {
        self.scheme
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    fn normalize_mac(raw: &str) -> String {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_ascii_lowercase();
        cleaned
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (scheme_str, value) = raw
            .split_once(':')
            .ok_or_else(|| DeviceIdError::MissingSeparator(raw.to_string()))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(DeviceIdError::EmptyValue);
        }
        let scheme = match scheme_str.to_ascii_lowercase().as_str() {
            "mac" => DeviceScheme::Mac,
            "uuid" => DeviceScheme::Uuid,
            "dns" => DeviceScheme::Dns,
            "serial" => DeviceScheme::Serial,
            other => return Err(DeviceIdError::UnknownScheme(other.to_string())),
        };
        let value = match scheme {
            DeviceScheme::Mac => Self::normalize_mac(value),
            DeviceScheme::Uuid => value.to_ascii_lowercase(),
            DeviceScheme::Dns | DeviceScheme::Serial => value.to_string(),
        };
        Ok(DeviceId { scheme, value })
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.value)
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
