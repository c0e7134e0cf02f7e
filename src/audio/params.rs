// Key/value parameter strings exchanged with endpoints and the hardware
// device, in the classic `key=value;key=value` wire shape.

use std::collections::BTreeMap;
use std::fmt;

use crate::audio::types::{AudioError, AudioResult, SampleFormat};

/// Recognised keys. Unknown keys are passed through to the hardware.
pub const KEY_SAMPLING_RATE: &str = "sampling_rate";
pub const KEY_FORMAT: &str = "format";
pub const KEY_CHANNELS: &str = "channels";
pub const KEY_FRAME_COUNT: &str = "frame_count";
pub const KEY_ROUTING: &str = "routing";

/// Ordered key/value parameter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    entries: BTreeMap<String, String>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;key=value` string. Empty segments are skipped;
    /// a segment without `=` is rejected.
    pub fn parse(s: &str) -> AudioResult<Self> {
        let mut map = ParameterMap::new();
        for pair in s.split(';') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or(AudioError::InvalidArgument("malformed parameter pair"))?;
            map.set(key, value);
        }
        Ok(map)
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_format(&self) -> Option<AudioResult<SampleFormat>> {
        self.get(KEY_FORMAT).map(|v| match v {
            "pcm16" | "16" => Ok(SampleFormat::Pcm16),
            "pcm8" | "8" => Ok(SampleFormat::Pcm8),
            _ => Err(AudioError::InvalidArgument("unknown format")),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Subset of this map restricted to `keys`, for `get_parameters` style
    /// queries.
    pub fn filtered(&self, keys: &[&str]) -> ParameterMap {
        let mut out = ParameterMap::new();
        for k in keys {
            if let Some(v) = self.get(k) {
                out.set(k, v);
            }
        }
        out
    }
}

impl fmt::Display for ParameterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.entries {
            if !first {
                write!(f, ";")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

impl std::str::FromStr for ParameterMap {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParameterMap::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_round_trip() {
        let m = ParameterMap::parse("sampling_rate=48000;routing=2").unwrap();
        assert_eq!(m.get_int(KEY_SAMPLING_RATE), Some(48000));
        assert_eq!(m.get(KEY_ROUTING), Some("2"));
        assert_eq!(m.to_string(), "routing=2;sampling_rate=48000");
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(ParameterMap::parse("sampling_rate").is_err());
        // trailing separator is fine
        assert!(ParameterMap::parse("channels=2;").is_ok());
    }

    #[test]
    fn filtered_returns_requested_subset() {
        let mut m = ParameterMap::new();
        m.set(KEY_SAMPLING_RATE, 44100).set(KEY_CHANNELS, 2);
        let sub = m.filtered(&[KEY_CHANNELS, "missing"]);
        assert_eq!(sub.get_int(KEY_CHANNELS), Some(2));
        assert!(sub.get("missing").is_none());
    }
}
