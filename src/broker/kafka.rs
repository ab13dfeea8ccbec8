//! Kafka transport backed by rdkafka.
//!
//! [`KafkaTransport`] opens a [`FutureProducer`] per producer and a
//! [`StreamConsumer`] per receiver session. Consumer offsets are stored
//! explicitly after each successful delivery (`enable.auto.offset.store` is
//! off) and committed by librdkafka's periodic auto-commit, so the group
//! checkpoint never moves past an undelivered record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Delivery, Record, Sink, SinkSpec, Source, SourceEvent, SourceSpec, Transport};
use crate::error::{ConnectError, ProduceError, SourceError};
use crate::message::Message;

/// Bound on broker reachability checks at connect time.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on a single publish, including client-side retries.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on flushing pending records at close.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens rdkafka clients.
#[derive(Debug, Clone, Default)]
pub struct KafkaTransport;

impl KafkaTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }

    fn producer_config(spec: &SinkSpec) -> ClientConfig {
        let mut config = ClientConfig::new();
        spec.endpoint.apply_security(&mut config);
        config
            .set("client.id", &spec.client_id)
            .set("acks", "1")
            .set("retries", "10")
            .set("compression.type", "snappy")
            .set("message.timeout.ms", DELIVERY_TIMEOUT.as_millis().to_string());
        config
    }

    fn consumer_config(spec: &SourceSpec) -> ClientConfig {
        let mut config = ClientConfig::new();
        spec.endpoint.apply_security(&mut config);
        config
            .set("client.id", &spec.client_id)
            .set("group.id", &spec.group)
            .set("partition.assignment.strategy", "roundrobin")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest");
        config
    }
}

#[async_trait::async_trait]
impl Transport for KafkaTransport {
    async fn open_sink(&self, spec: &SinkSpec) -> Result<Box<dyn Sink>, ConnectError> {
        let producer: FutureProducer = Self::producer_config(spec)
            .create()
            .map_err(|e| ConnectError::Broker(format!("failed to create producer: {}", e)))?;

        let client = producer.clone();
        let topic = spec.topic.clone();
        tokio::task::spawn_blocking(move || {
            client
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| ConnectError::Broker(e.to_string()))?
        .map_err(|e| ConnectError::Broker(e.to_string()))?;

        info!(
            client_id = %spec.client_id,
            brokers = %spec.endpoint.peers().join(","),
            topic = %spec.topic,
            "Kafka producer connected"
        );
        Ok(Box::new(KafkaSink { producer }))
    }

    async fn open_source(&self, spec: &SourceSpec) -> Result<Box<dyn Source>, ConnectError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<SessionContext> = Self::consumer_config(spec)
            .create_with_context(SessionContext { events: events_tx })
            .map_err(|e| ConnectError::Broker(format!("failed to create consumer: {}", e)))?;
        let consumer = Arc::new(consumer);

        let client = Arc::clone(&consumer);
        tokio::task::spawn_blocking(move || client.fetch_metadata(None, METADATA_TIMEOUT).map(|_| ()))
            .await
            .map_err(|e| ConnectError::Broker(e.to_string()))?
            .map_err(|e| ConnectError::Broker(e.to_string()))?;

        let topics: Vec<&str> = spec.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConnectError::Broker(format!("failed to subscribe: {}", e)))?;

        info!(
            client_id = %spec.client_id,
            brokers = %spec.endpoint.peers().join(","),
            group = %spec.group,
            topics = %spec.topics.join(","),
            "Kafka consumer connected"
        );
        Ok(Box::new(KafkaSource {
            consumer,
            events: events_rx,
            ready: false,
            closed: false,
        }))
    }
}

/// Publishing client.
pub struct KafkaSink {
    producer: FutureProducer,
}

impl std::fmt::Debug for KafkaSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSink").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Sink for KafkaSink {
    async fn send(&self, topic: &str, msg: &Message) -> Result<Delivery, ProduceError> {
        let mut headers = OwnedHeaders::new_with_capacity(msg.headers.len());
        for (key, value) in &msg.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::<(), [u8]>::to(topic)
            .payload(&msg.body[..])
            .timestamp(msg.timestamp.timestamp_millis())
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(DELIVERY_TIMEOUT))
            .await
            .map_err(|(err, _)| ProduceError::Broker(err.to_string()))?;

        Ok(Delivery { partition, offset })
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(FLUSH_TIMEOUT)) {
            warn!(error = %e, "Failed to flush producer");
        }
    }
}

/// Rebalance notifications forwarded from librdkafka's callback thread.
#[derive(Debug)]
enum SessionSignal {
    Assigned(usize),
    Revoked(usize),
    Failed(String),
}

/// Consumer context that forwards rebalance outcomes to the session.
struct SessionContext {
    events: mpsc::UnboundedSender<SessionSignal>,
}

impl ClientContext for SessionContext {}

impl ConsumerContext for SessionContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let signal = match rebalance {
            Rebalance::Assign(tpl) => SessionSignal::Assigned(tpl.count()),
            Rebalance::Revoke(tpl) => SessionSignal::Revoked(tpl.count()),
            Rebalance::Error(e) => SessionSignal::Failed(e.to_string()),
        };
        // the session may already be gone
        let _ = self.events.send(signal);
    }
}

/// One consumer-group session.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer<SessionContext>>,
    events: mpsc::UnboundedReceiver<SessionSignal>,
    ready: bool,
    closed: bool,
}

impl std::fmt::Debug for KafkaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSource")
            .field("ready", &self.ready)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl KafkaSource {
    fn on_signal(&mut self, signal: SessionSignal) -> Result<SourceEvent, SourceError> {
        match signal {
            SessionSignal::Assigned(count) if !self.ready => {
                self.ready = true;
                debug!(partitions = count, "Session ready");
                Ok(SourceEvent::Ready)
            }
            SessionSignal::Assigned(count) => {
                Ok(SourceEvent::Assigned(format!("assigned {} partitions", count)))
            }
            SessionSignal::Revoked(count) => {
                Ok(SourceEvent::Revoked(format!("revoked {} partitions", count)))
            }
            SessionSignal::Failed(e) => Err(SourceError::Broker(format!("rebalance failed: {}", e))),
        }
    }
}

/// Whether a consume error ends the session.
///
/// librdkafka reports transient conditions (unknown topic, partition fetch
/// errors, broker transport failures) through the consumer while it
/// recovers on its own; only fatal and authentication errors are final.
fn is_fatal(err: &KafkaError) -> bool {
    match err {
        KafkaError::MessageConsumption(code) => matches!(
            code,
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
        ),
        _ => true,
    }
}

fn to_record(msg: &BorrowedMessage<'_>) -> Record {
    let mut headers = BTreeMap::new();
    if let Some(hs) = msg.headers() {
        for h in hs.iter() {
            if let Some(value) = h.value {
                headers.insert(h.key.to_string(), String::from_utf8_lossy(value).into_owned());
            }
        }
    }

    Record {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        payload: Bytes::copy_from_slice(msg.payload().unwrap_or_default()),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        headers,
    }
}

#[async_trait::async_trait]
impl Source for KafkaSource {
    async fn next(&mut self) -> Option<Result<SourceEvent, SourceError>> {
        if self.closed {
            return None;
        }

        loop {
            tokio::select! {
                biased;
                Some(signal) = self.events.recv() => return Some(self.on_signal(signal)),
                result = self.consumer.recv() => match result {
                    Ok(m) => return Some(Ok(SourceEvent::Record(to_record(&m)))),
                    Err(e) if is_fatal(&e) => return Some(Err(SourceError::Broker(e.to_string()))),
                    Err(e) => warn!(error = %e, "Recoverable consumer error"),
                },
            }
        }
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), SourceError> {
        self.consumer
            .store_offset(topic, partition, offset)
            .map_err(|e| SourceError::Broker(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.consumer.commit_consumer_state(rdkafka::consumer::CommitMode::Sync) {
            debug!(error = %e, "Final offset commit skipped");
        }
        self.consumer.unsubscribe();
    }
}
