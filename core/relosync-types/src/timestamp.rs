//! Wall-clock timestamps in milliseconds since the Unix epoch.
//!
//! This is the representation used on the wire (`timestamp`, `enqueuedAt`)
//! and for cache bookkeeping. Parsing also accepts RFC 3339 strings, which is
//! how the REST layer reports `createdAt`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Parses an RFC 3339 date-time string.
    pub fn parse_rfc3339(s: &str) -> crate::Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| crate::Error::InvalidTimestamp(format!("{s}: {e}")))
    }

    /// Reads a timestamp from a JSON number (milliseconds) or RFC 3339 string.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Self),
            serde_json::Value::String(s) => Self::parse_rfc3339(s).ok(),
            _ => None,
        }
    }

    /// Renders the timestamp as an RFC 3339 string, if representable.
    #[must_use]
    pub fn to_rfc3339(&self) -> Option<String> {
        DateTime::<Utc>::from_timestamp_millis(self.0).map(|dt| dt.to_rfc3339())
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Some(s) => f.write_str(&s),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("expected epoch millis or RFC 3339 string, got {value}"))
        })
    }
}
