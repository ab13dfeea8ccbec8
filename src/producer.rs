//! HTTP-to-broker publishing unit.
//!
//! A [`Producer`] owns one broker [`Sink`] and publishes every message
//! submitted to `POST /send/{id}` onto its topic, answering with the
//! partition and offset the broker assigned.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::auth::Auth;
use crate::broker::{Delivery, Sink, SinkSpec, Transport};
use crate::config::ProducerConfig;
use crate::endpoint::EndpointDescriptor;
use crate::error::{AuthError, ConfigError, ConnectError, ProduceError};
use crate::message::Message;
use crate::metrics::record_send;

/// A validated producer.
#[derive(Debug)]
pub struct Producer {
    id: String,
    topic: String,
    auth: Auth,
    endpoint: EndpointDescriptor,
    sink: RwLock<Option<Arc<dyn Sink>>>,
}

impl Producer {
    /// Checks a producer configuration, collecting every violation.
    pub fn validate(config: &ProducerConfig, endpoint: &EndpointDescriptor) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if config.id.trim().is_empty() {
            errors.push(ConfigError::Required("id".to_string()));
        }
        if config.topic.trim().is_empty() {
            errors.push(ConfigError::Required("topic".to_string()));
        }
        if let Err(e) = endpoint.validate() {
            errors.push(e);
        }
        if let Err(e) = config.auth.mode() {
            errors.push(e);
        }
        errors
    }

    /// Builds a producer from its configuration.
    ///
    /// # Errors
    ///
    /// Returns every validation error of the unit.
    pub fn new(
        config: &ProducerConfig,
        endpoint: EndpointDescriptor,
    ) -> Result<Self, Vec<ConfigError>> {
        let errors = Self::validate(config, &endpoint);
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            id: config.id.clone(),
            topic: config.topic.clone(),
            auth: config.auth.clone(),
            endpoint,
            sink: RwLock::new(None),
        })
    }

    /// Producer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether a broker client is open.
    pub async fn is_connected(&self) -> bool {
        self.sink.read().await.is_some()
    }

    /// Opens the broker client.
    ///
    /// # Errors
    ///
    /// Returns the transport's `ConnectError` unchanged.
    pub async fn connect(&self, transport: &dyn Transport) -> Result<(), ConnectError> {
        let spec = SinkSpec {
            client_id: format!("melp-sender-{}", self.id),
            endpoint: self.endpoint.clone(),
            topic: self.topic.clone(),
        };
        let sink = transport.open_sink(&spec).await?;
        *self.sink.write().await = Some(Arc::from(sink));
        info!(producer = %self.id, topic = %self.topic, "Producer connected");
        Ok(())
    }

    /// Checks the `Authorization` header of an inbound request.
    pub fn authorize(&self, authorization: Option<&str>) -> Result<(), AuthError> {
        self.auth.validate(authorization)
    }

    /// Publishes `msg` and waits for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `ProduceError::NotConnected` before `connect` or after
    /// `close`, and `ProduceError::Broker` when the publish is rejected.
    pub async fn send(&self, msg: &Message) -> Result<Delivery, ProduceError> {
        let sink = self
            .sink
            .read()
            .await
            .clone()
            .ok_or_else(|| ProduceError::NotConnected(self.id.clone()))?;

        let delivery = sink.send(&self.topic, msg).await?;
        record_send(&self.topic, delivery.partition, msg.size());
        debug!(
            producer = %self.id,
            topic = %self.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            size = msg.size(),
            "Published message"
        );
        Ok(delivery)
    }

    /// Releases the broker client. Safe to call more than once.
    pub async fn close(&self) {
        let sink = self.sink.write().await.take();
        if let Some(sink) = sink {
            sink.close().await;
            info!(producer = %self.id, "Producer closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn config() -> ProducerConfig {
        ProducerConfig {
            id: "orders".to_string(),
            endpoint: "local".to_string(),
            topic: "orders".to_string(),
            auth: Auth::bearer("tok-123"),
            disabled: false,
        }
    }

    fn endpoint() -> EndpointDescriptor {
        EndpointDescriptor::new("localhost:9092", "", "")
    }

    #[test]
    fn test_validate_collects_every_error() {
        let config = ProducerConfig::default();
        let errors = Producer::validate(&config, &EndpointDescriptor::unresolved("x"));
        assert_eq!(
            errors,
            vec![
                ConfigError::Required("id".to_string()),
                ConfigError::Required("topic".to_string()),
                ConfigError::EndpointNotFound("x".to_string()),
                ConfigError::AuthModeRequired,
            ]
        );
    }

    #[test]
    fn test_validate_rejects_conflicting_auth() {
        let mut config = config();
        config.auth.anonymous = true;
        assert_eq!(
            Producer::validate(&config, &endpoint()),
            vec![ConfigError::ConflictingAuth]
        );
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let producer = Producer::new(&config(), endpoint()).unwrap();
        assert!(matches!(
            producer.send(&Message::new("x")).await,
            Err(ProduceError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_send_returns_delivery() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(&config(), endpoint()).unwrap();
        producer.connect(&broker).await.unwrap();

        let mut msg = Message::new(r#"{"x":1}"#);
        msg.add_header("x-request-id", "req-1");
        let delivery = producer.send(&msg).await.unwrap();
        assert_eq!(delivery, Delivery { partition: 0, offset: 0 });

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "orders");
        assert_eq!(published[0].1.header("x-request-id"), Some("req-1"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(&config(), endpoint()).unwrap();
        producer.connect(&broker).await.unwrap();
        assert!(producer.is_connected().await);

        producer.close().await;
        producer.close().await;
        assert!(!producer.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let broker = MemoryBroker::new();
        broker.fail_connects(1).await;
        let producer = Producer::new(&config(), endpoint()).unwrap();
        assert!(producer.connect(&broker).await.is_err());
        assert!(!producer.is_connected().await);
    }

    #[test]
    fn test_authorize_delegates_to_auth() {
        let producer = Producer::new(&config(), endpoint()).unwrap();
        assert!(producer.authorize(Some("Bearer tok-123")).is_ok());
        assert_eq!(producer.authorize(None), Err(AuthError::Required));
    }
}
