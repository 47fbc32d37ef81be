//! Serde helpers for human-readable durations (`"250ms"`, `"3s"`, `"5m"`, `"1h"`).
//!
//! Use with `#[serde(with = "flowgate_types::duration_serde")]`, or the
//! [`option`] submodule for `Option<Duration>` fields. Bare integers are read
//! as seconds.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawDuration::deserialize(deserializer)?;
    raw.into_duration().map_err(serde::de::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawDuration>::deserialize(deserializer)?;
        raw.map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(n) => Ok(Duration::from_secs(n)),
            RawDuration::Text(s) => parse_duration_str(&s),
        }
    }
}

fn format_duration(duration: &Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Parse a duration string with an `ms`, `s`, `m`, `h` or `d` suffix.
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(val) = s.strip_suffix("ms") {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_millis(n))
    } else if let Some(val) = s.strip_suffix('s') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n))
    } else if let Some(val) = s.strip_suffix('m') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 60))
    } else if let Some(val) = s.strip_suffix('h') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 3600))
    } else if let Some(val) = s.strip_suffix('d') {
        let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
        Ok(Duration::from_secs(n * 86400))
    } else {
        Err(format!("unknown duration format: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "crate::duration_serde")]
        every: Duration,
        #[serde(default, with = "crate::duration_serde::option")]
        limit: Option<Duration>,
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_duration_str("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration_str("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration_str("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse_duration_str("fast").is_err());
    }

    #[test]
    fn reads_strings_and_bare_seconds() {
        let h: Holder = serde_json::from_str(r#"{"every": "1500ms", "limit": 30}"#).unwrap();
        assert_eq!(h.every, Duration::from_millis(1500));
        assert_eq!(h.limit, Some(Duration::from_secs(30)));

        let h: Holder = serde_json::from_str(r#"{"every": 2}"#).unwrap();
        assert_eq!(h.every, Duration::from_secs(2));
        assert_eq!(h.limit, None);
    }

    #[test]
    fn writes_milliseconds() {
        let h = Holder {
            every: Duration::from_secs(2),
            limit: None,
        };
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["every"], "2000ms");
        assert!(json["limit"].is_null());
    }
}
