//! In-process broker for tests and dry runs
//!
//! [`MemoryBroker`] implements [`Transport`] on shared in-memory state:
//! per-partition record logs, per-group committed offsets, and a commit
//! history. A test seeds records, wires the broker into the code under test,
//! then inspects what was published and committed.
//!
//! Sessions opened through [`Transport::open_source`] resume each
//! partition after the group's committed offset, so an uncommitted record is
//! redelivered by the next session exactly as a real consumer group would.
//!
//! # Example
//!
//! ```
//! use melp::broker::memory::MemoryBroker;
//! use melp::broker::{Record, Source, SourceEvent, SourceSpec, Transport};
//! use melp::endpoint::EndpointDescriptor;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! broker.push(Record {
//!     topic: "orders".to_string(),
//!     partition: 0,
//!     offset: 42,
//!     payload: bytes::Bytes::from_static(b"{\"x\":1}"),
//!     timestamp: None,
//!     headers: Default::default(),
//! }).await;
//!
//! let spec = SourceSpec {
//!     client_id: "test".to_string(),
//!     endpoint: EndpointDescriptor::new("localhost", "", ""),
//!     topics: vec!["orders".to_string()],
//!     group: "hook".to_string(),
//! };
//! let mut source = broker.open_source(&spec).await.unwrap();
//! assert_eq!(source.next().await.unwrap().unwrap(), SourceEvent::Ready);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};

use super::{Delivery, Record, Sink, SinkSpec, Source, SourceEvent, SourceSpec, Transport};
use crate::error::{ConnectError, ProduceError, SourceError};
use crate::message::Message;

type PartitionKey = (String, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupChange {
    Revoke,
    Assign,
}

#[derive(Debug, Default)]
struct State {
    logs: BTreeMap<PartitionKey, Vec<Record>>,
    committed: HashMap<(String, PartitionKey), i64>,
    commit_log: Vec<(String, String, i32, i64)>,
    published: Vec<(String, Message, Delivery)>,
    connect_failures: u32,
    publish_failure: Option<String>,
    source_errors: Vec<String>,
    group_changes: Vec<GroupChange>,
    sinks_opened: usize,
    sources_opened: usize,
}

/// Shared in-memory broker.
///
/// Cloning yields another handle on the same state.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changed: Arc::new(changed),
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Appends a record to its partition log.
    ///
    /// Logs are kept ordered by offset.
    pub async fn push(&self, record: Record) {
        {
            let mut state = self.state.lock().await;
            let log = state
                .logs
                .entry((record.topic.clone(), record.partition))
                .or_default();
            let pos = log.partition_point(|r| r.offset < record.offset);
            log.insert(pos, record);
        }
        self.notify();
    }

    /// Appends a record with the given body at the next offset of partition 0.
    pub async fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Delivery {
        let body = body.into();
        let delivery = {
            let mut state = self.state.lock().await;
            append(&mut state, topic, body, BTreeMap::new())
        };
        self.notify();
        delivery
    }

    /// Makes the next `count` connection attempts fail.
    pub async fn fail_connects(&self, count: u32) {
        self.state.lock().await.connect_failures = count;
    }

    /// Makes every publish fail with `reason`, or succeed again with `None`.
    pub async fn fail_publishes(&self, reason: Option<&str>) {
        self.state.lock().await.publish_failure = reason.map(str::to_string);
    }

    /// Makes the next `next()` of an open session return a client error.
    pub async fn inject_source_error(&self, reason: &str) {
        self.state.lock().await.source_errors.push(reason.to_string());
        self.notify();
    }

    /// Signals a full group rebalance (revoke, then assign) to every open
    /// session.
    pub async fn rebalance(&self) {
        self.group_change(&[GroupChange::Revoke, GroupChange::Assign])
            .await;
    }

    /// Revokes every partition of every open session. Sessions yield no
    /// records until [`MemoryBroker::assign_partitions`].
    pub async fn revoke_partitions(&self) {
        self.group_change(&[GroupChange::Revoke]).await;
    }

    /// Assigns partitions back to every open session; consumption resumes
    /// after the committed offsets.
    pub async fn assign_partitions(&self) {
        self.group_change(&[GroupChange::Assign]).await;
    }

    async fn group_change(&self, changes: &[GroupChange]) {
        self.state.lock().await.group_changes.extend_from_slice(changes);
        self.notify();
    }

    /// Last offset committed by `group` on `topic`/`partition`.
    pub async fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .await
            .committed
            .get(&(group.to_string(), (topic.to_string(), partition)))
            .copied()
    }

    /// Every commit in order, as `(group, topic, partition, offset)`.
    pub async fn commit_log(&self) -> Vec<(String, String, i32, i64)> {
        self.state.lock().await.commit_log.clone()
    }

    /// Every message published through a sink, with its topic and delivery.
    pub async fn published(&self) -> Vec<(String, Message, Delivery)> {
        self.state.lock().await.published.clone()
    }

    /// Number of sinks opened so far.
    pub async fn sinks_opened(&self) -> usize {
        self.state.lock().await.sinks_opened
    }

    /// Number of sessions opened so far.
    pub async fn sources_opened(&self) -> usize {
        self.state.lock().await.sources_opened
    }

    fn take_connect_failure(state: &mut State) -> Result<(), ConnectError> {
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(ConnectError::Broker("connection refused".to_string()));
        }
        Ok(())
    }
}

fn append(
    state: &mut State,
    topic: &str,
    payload: Bytes,
    headers: BTreeMap<String, String>,
) -> Delivery {
    let log = state.logs.entry((topic.to_string(), 0)).or_default();
    let offset = log.last().map(|r| r.offset + 1).unwrap_or(0);
    log.push(Record {
        topic: topic.to_string(),
        partition: 0,
        offset,
        payload,
        timestamp: None,
        headers,
    });
    Delivery {
        partition: 0,
        offset,
    }
}

#[async_trait::async_trait]
impl Transport for MemoryBroker {
    async fn open_sink(&self, _spec: &SinkSpec) -> Result<Box<dyn Sink>, ConnectError> {
        let mut state = self.state.lock().await;
        Self::take_connect_failure(&mut state)?;
        state.sinks_opened += 1;
        Ok(Box::new(MemorySink {
            broker: self.clone(),
        }))
    }

    async fn open_source(&self, spec: &SourceSpec) -> Result<Box<dyn Source>, ConnectError> {
        let mut state = self.state.lock().await;
        Self::take_connect_failure(&mut state)?;
        state.sources_opened += 1;
        Ok(Box::new(MemorySource {
            broker: self.clone(),
            changed: self.changed.subscribe(),
            group: spec.group.clone(),
            topics: spec.topics.clone(),
            cursors: HashMap::new(),
            changes_seen: state.group_changes.len(),
            revoked: false,
            ready: false,
            closed: false,
        }))
    }
}

/// Sink writing into a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySink {
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl Sink for MemorySink {
    async fn send(&self, topic: &str, msg: &Message) -> Result<Delivery, ProduceError> {
        let delivery = {
            let mut state = self.broker.state.lock().await;
            if let Some(reason) = &state.publish_failure {
                return Err(ProduceError::Broker(reason.clone()));
            }
            let delivery = append(&mut state, topic, msg.body.clone(), msg.headers.clone());
            state
                .published
                .push((topic.to_string(), msg.clone(), delivery));
            delivery
        };
        self.broker.notify();
        Ok(delivery)
    }

    async fn close(&self) {}
}

/// A consumer-group session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySource {
    broker: MemoryBroker,
    changed: watch::Receiver<u64>,
    group: String,
    topics: Vec<String>,
    cursors: HashMap<PartitionKey, i64>,
    changes_seen: usize,
    revoked: bool,
    ready: bool,
    closed: bool,
}

impl MemorySource {
    fn poll_state(&mut self, state: &mut State) -> Option<Result<SourceEvent, SourceError>> {
        if !state.source_errors.is_empty() {
            let reason = state.source_errors.remove(0);
            return Some(Err(SourceError::Broker(reason)));
        }

        if let Some(change) = state.group_changes.get(self.changes_seen).copied() {
            self.changes_seen += 1;
            let event = match change {
                GroupChange::Revoke => {
                    self.revoked = true;
                    SourceEvent::Revoked("memory revoke".to_string())
                }
                GroupChange::Assign => {
                    self.revoked = false;
                    self.cursors.clear();
                    SourceEvent::Assigned("memory assign".to_string())
                }
            };
            return Some(Ok(event));
        }
        if self.revoked {
            return None;
        }

        for ((topic, partition), log) in &state.logs {
            if !self.topics.contains(topic) {
                continue;
            }
            let key = (topic.clone(), *partition);
            let cursor = match self.cursors.get(&key) {
                Some(c) => *c,
                None => state
                    .committed
                    .get(&(self.group.clone(), key.clone()))
                    .map(|c| c + 1)
                    .unwrap_or(i64::MIN),
            };
            if let Some(record) = log.iter().find(|r| r.offset >= cursor) {
                self.cursors.insert(key, record.offset + 1);
                return Some(Ok(SourceEvent::Record(record.clone())));
            }
        }

        None
    }
}

#[async_trait::async_trait]
impl Source for MemorySource {
    async fn next(&mut self) -> Option<Result<SourceEvent, SourceError>> {
        if self.closed {
            return None;
        }
        if !self.ready {
            self.ready = true;
            return Some(Ok(SourceEvent::Ready));
        }

        loop {
            // mark the current version seen before scanning, so a change
            // made during the scan wakes the wait below
            self.changed.borrow_and_update();
            {
                let broker = self.broker.clone();
                let mut state = broker.state.lock().await;
                if let Some(event) = self.poll_state(&mut state) {
                    return Some(event);
                }
            }
            if self.changed.changed().await.is_err() {
                return Some(Err(SourceError::Closed));
            }
        }
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), SourceError> {
        let mut state = self.broker.state.lock().await;
        state.committed.insert(
            (self.group.clone(), (topic.to_string(), partition)),
            offset,
        );
        state
            .commit_log
            .push((self.group.clone(), topic.to_string(), partition, offset));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::endpoint::EndpointDescriptor;

    fn source_spec(group: &str) -> SourceSpec {
        SourceSpec {
            client_id: "test".to_string(),
            endpoint: EndpointDescriptor::new("localhost", "", ""),
            topics: vec!["orders".to_string()],
            group: group.to_string(),
        }
    }

    fn sink_spec() -> SinkSpec {
        SinkSpec {
            client_id: "test".to_string(),
            endpoint: EndpointDescriptor::new("localhost", "", ""),
            topic: "orders".to_string(),
        }
    }

    async fn next_record(source: &mut Box<dyn Source>) -> Record {
        let event = tokio::time::timeout(Duration::from_secs(2), source.next())
            .await
            .expect("timed out")
            .expect("source closed")
            .expect("source error");
        match event {
            SourceEvent::Record(r) => r,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_assigns_sequential_offsets() {
        let broker = MemoryBroker::new();
        let sink = broker.open_sink(&sink_spec()).await.unwrap();

        let first = sink.send("orders", &Message::new("a")).await.unwrap();
        let second = sink.send("orders", &Message::new("b")).await.unwrap();

        assert_eq!(first, Delivery { partition: 0, offset: 0 });
        assert_eq!(second, Delivery { partition: 0, offset: 1 });
        assert_eq!(broker.published().await.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure() {
        let broker = MemoryBroker::new();
        let sink = broker.open_sink(&sink_spec()).await.unwrap();
        broker.fail_publishes(Some("leader not available")).await;

        assert!(matches!(
            sink.send("orders", &Message::new("a")).await,
            Err(ProduceError::Broker(_))
        ));
    }

    #[tokio::test]
    async fn test_session_starts_ready_then_yields_records() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a").await;
        broker.publish("other", "b").await;

        let mut source = broker.open_source(&source_spec("g")).await.unwrap();
        assert_eq!(source.next().await.unwrap().unwrap(), SourceEvent::Ready);

        let record = next_record(&mut source).await;
        assert_eq!(record.offset, 0);
        assert_eq!(&record.payload[..], b"a");
    }

    #[tokio::test]
    async fn test_session_waits_for_new_records() {
        let broker = MemoryBroker::new();
        let mut source = broker.open_source(&source_spec("g")).await.unwrap();
        source.next().await;

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("orders", "late").await;
        });

        let record = next_record(&mut source).await;
        assert_eq!(&record.payload[..], b"late");
    }

    #[tokio::test]
    async fn test_new_session_resumes_after_committed_offset() {
        let broker = MemoryBroker::new();
        for body in ["a", "b", "c"] {
            broker.publish("orders", body).await;
        }

        let mut source = broker.open_source(&source_spec("g")).await.unwrap();
        source.next().await;
        let first = next_record(&mut source).await;
        source.commit(&first.topic, first.partition, first.offset).await.unwrap();
        let _uncommitted = next_record(&mut source).await;
        source.close().await;
        assert!(source.next().await.is_none());

        let mut source = broker.open_source(&source_spec("g")).await.unwrap();
        source.next().await;
        assert_eq!(next_record(&mut source).await.offset, 1);
        assert_eq!(broker.committed("g", "orders", 0).await, Some(0));
        assert_eq!(broker.sources_opened().await, 2);
    }

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let broker = MemoryBroker::new();
        broker.fail_connects(1).await;
        assert!(broker.open_source(&source_spec("g")).await.is_err());
        assert!(broker.open_source(&source_spec("g")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rebalance_and_errors_are_signalled() {
        let broker = MemoryBroker::new();
        let mut source = broker.open_source(&source_spec("g")).await.unwrap();
        source.next().await;

        broker.rebalance().await;
        assert!(matches!(
            source.next().await,
            Some(Ok(SourceEvent::Revoked(_)))
        ));
        assert!(matches!(
            source.next().await,
            Some(Ok(SourceEvent::Assigned(_)))
        ));

        broker.inject_source_error("broker down").await;
        assert!(matches!(
            source.next().await,
            Some(Err(SourceError::Broker(_)))
        ));
    }

    #[tokio::test]
    async fn test_revoked_session_pauses_until_assigned() {
        let broker = MemoryBroker::new();
        let mut source = broker.open_source(&source_spec("g")).await.unwrap();
        source.next().await;

        broker.revoke_partitions().await;
        broker.publish("orders", "held").await;
        assert!(matches!(
            source.next().await,
            Some(Ok(SourceEvent::Revoked(_)))
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), source.next())
                .await
                .is_err()
        );

        broker.assign_partitions().await;
        assert!(matches!(
            source.next().await,
            Some(Ok(SourceEvent::Assigned(_)))
        ));
        let record = next_record(&mut source).await;
        assert_eq!(&record.payload[..], b"held");
    }
}
