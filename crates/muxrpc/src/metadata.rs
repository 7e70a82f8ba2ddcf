//! Ordered call metadata (headers and trailers).
//!
//! Keys are case-insensitive and stored lower-cased. Binary values are only
//! accepted under keys ending in [`BINARY_SUFFIX`]; ASCII values are rejected
//! under such keys so the two kinds stay distinguishable on the wire.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Key suffix marking a binary-valued entry.
pub const BINARY_SUFFIX: &str = "-bin";

/// Pseudo-header carrying the method path.
pub const PATH_KEY: &str = ":path";
/// Remaining call deadline.
pub const TIMEOUT_KEY: &str = "grpc-timeout";
/// Encoding of compressed messages on this stream.
pub const ENCODING_KEY: &str = "grpc-encoding";
/// Encodings the sender can decompress.
pub const ACCEPT_ENCODING_KEY: &str = "grpc-accept-encoding";

/// Formats a timeout header value in whole milliseconds, rounding up so a
/// nonzero remainder never reads as zero.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    let millis = (nanos + 999_999) / 1_000_000;
    format!("{}m", millis.min(99_999_999))
}

/// Parses a timeout header value (`<digits><unit>`, unit one of `HMSmun`).
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    let d = match unit {
        "H" => Duration::from_secs(n.checked_mul(3600)?),
        "M" => Duration::from_secs(n.checked_mul(60)?),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    };
    Some(d)
}

/// Errors produced when inserting metadata.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The key is empty or contains characters outside `[a-z0-9-_.]`.
    #[error("invalid metadata key: {key:?}")]
    InvalidKey {
        /// The rejected key.
        key: String,
    },
    /// A binary value was inserted under a key without the `-bin` suffix.
    #[error("binary metadata value requires a key ending in -bin: {key:?}")]
    BinaryKeyRequired {
        /// The rejected key.
        key: String,
    },
    /// An ASCII value was inserted under a `-bin` key.
    #[error("ascii metadata value cannot use a -bin key: {key:?}")]
    AsciiKeyRequired {
        /// The rejected key.
        key: String,
    },
    /// An ASCII value contains non-printable characters.
    #[error("metadata value for {key:?} is not printable ascii")]
    InvalidValue {
        /// The key whose value was rejected.
        key: String,
    },
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable ASCII text.
    Ascii(String),
    /// Arbitrary bytes, only under `-bin` keys.
    Binary(Bytes),
}

impl MetadataValue {
    /// Returns the text if this is an ASCII value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// Returns the bytes if this is a binary value.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            MetadataValue::Binary(b) => Some(b),
            MetadataValue::Ascii(_) => None,
        }
    }
}

/// Ordered multimap of metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

fn normalize_key(key: &str) -> Result<String, MetadataError> {
    let lower = key.to_ascii_lowercase();
    let body = lower.strip_prefix(':').unwrap_or(&lower);
    let valid = !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(lower)
    } else {
        Err(MetadataError::InvalidKey { key: key.to_string() })
    }
}

fn is_binary_key(key: &str) -> bool {
    key.ends_with(BINARY_SUFFIX)
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ASCII entry, keeping any existing values for the key.
    pub fn append(&mut self, key: &str, value: &str) -> Result<(), MetadataError> {
        let key = normalize_key(key)?;
        if is_binary_key(&key) {
            return Err(MetadataError::AsciiKeyRequired { key });
        }
        if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(MetadataError::InvalidValue { key });
        }
        self.entries
            .push((key, MetadataValue::Ascii(value.to_string())));
        Ok(())
    }

    /// Replaces all values for the key with a single ASCII value.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), MetadataError> {
        let normalized = normalize_key(key)?;
        self.entries.retain(|(k, _)| *k != normalized);
        self.append(key, value)
    }

    /// Appends a binary entry. The key must end in `-bin`.
    pub fn append_bin(&mut self, key: &str, value: impl Into<Bytes>) -> Result<(), MetadataError> {
        let key = normalize_key(key)?;
        if !is_binary_key(&key) {
            return Err(MetadataError::BinaryKeyRequired { key });
        }
        self.entries.push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// Replaces all values for the key with a single binary value.
    pub fn insert_bin(&mut self, key: &str, value: impl Into<Bytes>) -> Result<(), MetadataError> {
        let normalized = normalize_key(key)?;
        self.entries.retain(|(k, _)| *k != normalized);
        self.append_bin(key, value)
    }

    /// First ASCII value for the key.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.as_str())
    }

    /// First binary value for the key.
    pub fn get_bin(&self, key: &str) -> Option<&Bytes> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.as_bytes())
    }

    /// All values for the key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Removes every value for the key, returning how many were removed.
    pub fn remove(&mut self, key: &str) -> usize {
        let key = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        before - self.entries.len()
    }

    /// Returns true if at least one value exists for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Appends every entry of `other`.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    /// Iterates entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
