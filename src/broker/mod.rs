//! Broker capability abstraction and implementations
//!
//! Producers and receivers never talk to a broker client library directly.
//! They go through a capability pair:
//!
//! - [`Sink`]: publishes a [`Message`] and returns where it landed
//! - [`Source`]: a consumer-group session yielding [`SourceEvent`]s, with
//!   explicit per-offset [`Source::commit`]
//!
//! A [`Transport`] opens both. Concrete implementations live in submodules:
//!
//! - [`kafka::KafkaTransport`]: rdkafka-backed, used in production
//! - [`memory::MemoryBroker`]: in-process broker for tests and dry runs
//!
//! # Canonical Import Path
//!
//! ```no_run
//! use melp::broker::{Sink, Source, Transport};
//! ```

pub mod kafka;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::endpoint::EndpointDescriptor;
use crate::error::{ConnectError, ProduceError, SourceError};
use crate::message::{Message, META_OFFSET, META_PARTITION, META_TOPIC};

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Delivery {
    /// Partition the record was written to
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// A record read from a consumer-group session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record value
    pub payload: Bytes,
    /// Broker timestamp, if the record carries one
    pub timestamp: Option<DateTime<Utc>>,
    /// Record headers
    pub headers: BTreeMap<String, String>,
}

impl Record {
    /// Converts the record into a [`Message`] carrying topic, partition and
    /// offset as metadata and the record headers as application headers.
    pub fn into_message(self) -> Message {
        let mut msg = Message::new(self.payload);
        if let Some(ts) = self.timestamp {
            msg = msg.with_timestamp(ts);
        }
        msg.add_metadata(META_TOPIC, self.topic);
        msg.add_metadata(META_PARTITION, self.partition.to_string());
        msg.add_metadata(META_OFFSET, self.offset.to_string());
        for (k, v) in &self.headers {
            msg.add_header(k, v);
        }
        msg
    }
}

/// What a [`Source`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// The session has its partition assignment and is consuming
    Ready,
    /// Partitions were taken away; no records until the next assignment
    Revoked(String),
    /// Partitions were (re)assigned after the session became ready
    Assigned(String),
    /// A record to process
    Record(Record),
}

/// Settings for opening a [`Sink`].
#[derive(Debug, Clone)]
pub struct SinkSpec {
    /// Broker client identifier
    pub client_id: String,
    /// Broker address and security
    pub endpoint: EndpointDescriptor,
    /// Destination topic
    pub topic: String,
}

/// Settings for opening a [`Source`].
#[derive(Debug, Clone)]
pub struct SourceSpec {
    /// Broker client identifier
    pub client_id: String,
    /// Broker address and security
    pub endpoint: EndpointDescriptor,
    /// Subscribed topics
    pub topics: Vec<String>,
    /// Consumer group name
    pub group: String,
}

/// Publishing side of a broker connection.
#[async_trait::async_trait]
pub trait Sink: Send + Sync + Debug {
    /// Publishes `msg` onto `topic` and waits for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `ProduceError::Broker` if the broker rejected the record or
    /// the acknowledgement timed out.
    async fn send(&self, topic: &str, msg: &Message) -> Result<Delivery, ProduceError>;

    /// Flushes pending records and releases the client.
    async fn close(&self);
}

/// Consuming side of a broker connection: one consumer-group session.
#[async_trait::async_trait]
pub trait Source: Send + Sync + Debug {
    /// Waits for the next session event.
    ///
    /// Returns `None` once the source has been closed.
    async fn next(&mut self) -> Option<Result<SourceEvent, SourceError>>;

    /// Marks `offset` of `topic`/`partition` as processed, advancing the
    /// group checkpoint past it.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Broker` if the client refused the offset.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), SourceError>;

    /// Leaves the group and releases the client.
    async fn close(&mut self);
}

/// Opens broker connections.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Opens a publishing client.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Broker` if the client cannot be created or the
    /// broker cannot be reached.
    async fn open_sink(&self, spec: &SinkSpec) -> Result<Box<dyn Sink>, ConnectError>;

    /// Opens a consumer-group session subscribed to `spec.topics`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Broker` if the client cannot be created, the
    /// broker cannot be reached or the subscription is refused.
    async fn open_source(&self, spec: &SourceSpec) -> Result<Box<dyn Source>, ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_into_message_carries_provenance() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("empty".to_string(), String::new());

        let record = Record {
            topic: "orders".to_string(),
            partition: 0,
            offset: 42,
            payload: Bytes::from_static(b"{\"x\":1}"),
            timestamp: None,
            headers,
        };
        let msg = record.into_message();

        assert_eq!(msg.metadata.get(META_TOPIC).unwrap(), "orders");
        assert_eq!(msg.metadata.get(META_PARTITION).unwrap(), "0");
        assert_eq!(msg.metadata.get(META_OFFSET).unwrap(), "42");
        assert_eq!(msg.header("content-type"), Some("application/json"));
        assert!(msg.header("empty").is_none());
        assert_eq!(&msg.body[..], b"{\"x\":1}");
    }

    #[test]
    fn test_delivery_serializes_as_json() {
        let delivery = Delivery {
            partition: 3,
            offset: 17,
        };
        assert_eq!(
            serde_json::to_string(&delivery).unwrap(),
            r#"{"partition":3,"offset":17}"#
        );
    }
}
