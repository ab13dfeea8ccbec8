//! The unit of transfer between HTTP and the broker.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Metadata key for the source topic.
pub const META_TOPIC: &str = "topic";
/// Metadata key for the source partition.
pub const META_PARTITION: &str = "partition";
/// Metadata key for the source offset.
pub const META_OFFSET: &str = "offset";

/// A message travelling through the bridge.
///
/// `metadata` carries broker provenance (topic, partition, offset) and is
/// only ever exposed outbound under a reserved header prefix. `headers`
/// carries application headers, canonicalized to lower-case names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Payload
    pub body: Bytes,
    /// Broker or request timestamp
    pub timestamp: DateTime<Utc>,
    /// Broker provenance
    pub metadata: BTreeMap<String, String>,
    /// Application headers
    pub headers: BTreeMap<String, String>,
}

impl Message {
    /// Creates a message with the given body, stamped now.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds a provenance entry.
    pub fn add_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Adds an application header. Empty names or values are ignored.
    pub fn add_header(&mut self, key: &str, value: &str) {
        let key = key.trim();
        if key.is_empty() || value.is_empty() {
            return;
        }
        self.headers
            .insert(key.to_ascii_lowercase(), value.to_string());
    }

    /// Looks up an application header, case-insensitively.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body length in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_canonicalized() {
        let mut msg = Message::new("x");
        msg.add_header("Content-Type", "application/json");
        msg.add_header("X-Request-Id", "");
        assert_eq!(msg.header("content-type"), Some("application/json"));
        assert_eq!(msg.header("CONTENT-TYPE"), Some("application/json"));
        assert!(msg.header("x-request-id").is_none());
    }

    #[test]
    fn test_metadata_is_separate_from_headers() {
        let mut msg = Message::new(Bytes::from_static(b"{\"x\":1}"));
        msg.add_metadata(META_OFFSET, "42");
        assert_eq!(msg.metadata.get(META_OFFSET).map(String::as_str), Some("42"));
        assert!(msg.header(META_OFFSET).is_none());
        assert_eq!(msg.size(), 7);
    }
}
