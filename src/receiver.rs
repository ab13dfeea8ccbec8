//! Broker-to-HTTP delivery unit.
//!
//! A [`Receiver`] is one consumer-group member. Its session loop pulls
//! records in order, forwards each through a [`CallbackSender`] and commits
//! the record's offset only after the callback accepted it.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Listening -> (Rebalancing -> Listening)*
//!      ^                                          |
//!      +---------- delivery failure: reconnect ---+
//! ```
//!
//! A failed delivery ends the session without committing, so no later offset
//! of that session is processed. A supervised reconnect task then waits the
//! restart delay, opens a new session and resumes from the last committed
//! offset, redelivering the failed record.
//!
//! Client errors other than an orderly close, and failures to reconnect, are
//! reported as [`Fatal`] to the process supervisor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::{Record, Source, SourceEvent, SourceSpec, Transport};
use crate::callback::CallbackSender;
use crate::config::ReceiverConfig;
use crate::endpoint::EndpointDescriptor;
use crate::error::{ConfigError, ConnectError, DeliveryError, SourceError};
use crate::metrics::DeliveryMetrics;
use crate::retry::RetryPolicy;

/// Observable receiver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// No open session
    Disconnected,
    /// Opening or waiting for the first assignment
    Connecting,
    /// Consuming
    Listening,
    /// Partition assignment changing
    Rebalancing,
}

/// An unrecoverable receiver failure; the process should exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    /// Receiver that failed
    pub receiver: String,
    /// What went wrong
    pub reason: String,
}

/// Shared runtime pieces a receiver needs.
#[derive(Debug, Clone)]
pub struct ReceiverContext {
    /// Opens broker sessions
    pub transport: Arc<dyn Transport>,
    /// Shutdown barrier tracking session loops and reconnects
    pub tracker: TaskTracker,
    /// Cancelled on shutdown; each receiver uses a child token
    pub shutdown: CancellationToken,
    /// Where unrecoverable failures are reported
    pub fatal: mpsc::UnboundedSender<Fatal>,
    /// Restart policy applied after a failed delivery
    pub restart: RetryPolicy,
    /// Per-send retry policy of the callback sender
    pub callback_retry: RetryPolicy,
    /// Prefix for provenance headers on callbacks
    pub metadata_prefix: String,
}

/// Handle on a receiver. Cloning yields another handle on the same unit.
#[derive(Debug, Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    topics: Vec<String>,
    group: String,
    endpoint: EndpointDescriptor,
    sender: CallbackSender,
    transport: Arc<dyn Transport>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    fatal: mpsc::UnboundedSender<Fatal>,
    restart: RetryPolicy,
    restarts: AtomicU32,
    state: watch::Sender<ReceiverState>,
    pending: Mutex<Option<Box<dyn Source>>>,
}

/// Why a session loop ended.
enum SessionEnd {
    Cancelled,
    Closed,
    Failed(SourceError),
    Undelivered {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl Receiver {
    /// Checks a receiver configuration, collecting every violation.
    ///
    /// Also resolves the callback auth block: one with neither bearer nor
    /// basic becomes anonymous.
    pub fn validate(config: &mut ReceiverConfig, endpoint: &EndpointDescriptor) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if config.id.trim().is_empty() {
            errors.push(ConfigError::Required("id".to_string()));
        }
        if config.group.trim().is_empty() {
            errors.push(ConfigError::Required("group".to_string()));
        }
        if config.topics.iter().all(|t| t.trim().is_empty()) {
            errors.push(ConfigError::Required("topics".to_string()));
        }
        if let Err(e) = endpoint.validate() {
            errors.push(e);
        }
        errors.extend(config.callback.validate());
        errors
    }

    /// Builds a receiver from its configuration.
    ///
    /// # Errors
    ///
    /// Returns every validation error of the unit.
    pub fn new(
        mut config: ReceiverConfig,
        endpoint: EndpointDescriptor,
        ctx: ReceiverContext,
    ) -> Result<Self, Vec<ConfigError>> {
        let errors = Self::validate(&mut config, &endpoint);
        if !errors.is_empty() {
            return Err(errors);
        }

        let sender = CallbackSender::new(config.callback, &ctx.metadata_prefix)
            .map_err(|e| vec![ConfigError::Invalid(format!("callback: {}", e))])?
            .with_retry_policy(ctx.callback_retry);

        let (state, _) = watch::channel(ReceiverState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                id: config.id,
                topics: config.topics.into_iter().filter(|t| !t.trim().is_empty()).collect(),
                group: config.group,
                endpoint,
                sender,
                transport: ctx.transport,
                tracker: ctx.tracker,
                cancel: ctx.shutdown.child_token(),
                fatal: ctx.fatal,
                restart: ctx.restart,
                restarts: AtomicU32::new(0),
                state,
                pending: Mutex::new(None),
            }),
        })
    }

    /// Receiver identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current state.
    pub fn state(&self) -> ReceiverState {
        *self.inner.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ReceiverState> {
        self.inner.state.subscribe()
    }

    /// Opens a consumer-group session. No retry happens here.
    ///
    /// # Errors
    ///
    /// Returns the transport's `ConnectError` unchanged.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.connect().await
    }

    /// Starts the session loop and waits until the session is ready.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Invalid` when called without a prior
    /// `connect`, and `ConnectError::SessionLost` when the loop ends before
    /// the session becomes ready.
    pub async fn listen(&self) -> Result<(), ConnectError> {
        self.inner.listen().await
    }

    /// Stops the receiver. An in-flight callback is allowed to finish; no
    /// reconnect happens afterwards.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(mut source) = self.inner.pending.lock().await.take() {
            source.close().await;
            self.inner.state.send_replace(ReceiverState::Disconnected);
        }
        debug!(receiver = %self.inner.id, "Receiver close requested");
    }
}

impl Inner {
    fn set_state(&self, state: ReceiverState) {
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.set_state(ReceiverState::Connecting);
        let spec = SourceSpec {
            client_id: format!("melp-reader-{}", self.id),
            endpoint: self.endpoint.clone(),
            topics: self.topics.clone(),
            group: self.group.clone(),
        };
        match self.transport.open_source(&spec).await {
            Ok(source) => {
                *self.pending.lock().await = Some(source);
                info!(
                    receiver = %self.id,
                    group = %self.group,
                    topics = %self.topics.join(","),
                    "Receiver connected"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ReceiverState::Disconnected);
                Err(e)
            }
        }
    }

    async fn listen(self: &Arc<Self>) -> Result<(), ConnectError> {
        let source = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| ConnectError::Invalid(self.id.clone()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        self.tracker.spawn(inner.run(source, ready_tx));

        ready_rx
            .await
            .map_err(|_| ConnectError::SessionLost(self.id.clone()))
    }

    async fn run(self: Arc<Self>, mut source: Box<dyn Source>, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);

        let end = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                event = source.next() => event,
            };

            match event {
                None | Some(Err(SourceError::Closed)) => break SessionEnd::Closed,
                Some(Err(e)) => break SessionEnd::Failed(e),
                Some(Ok(SourceEvent::Ready)) => {
                    self.set_state(ReceiverState::Listening);
                    self.restarts.store(0, Ordering::SeqCst);
                    info!(receiver = %self.id, "Session ready");
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                Some(Ok(SourceEvent::Revoked(reason))) => {
                    self.set_state(ReceiverState::Rebalancing);
                    info!(receiver = %self.id, reason = %reason, "Partitions revoked");
                }
                Some(Ok(SourceEvent::Assigned(reason))) => {
                    self.set_state(ReceiverState::Listening);
                    info!(receiver = %self.id, reason = %reason, "Partitions assigned");
                }
                Some(Ok(SourceEvent::Record(record))) => {
                    if let Err(end) = self.process(source.as_ref(), record).await {
                        break end;
                    }
                }
            }
        };

        source.close().await;
        self.set_state(ReceiverState::Disconnected);

        match end {
            SessionEnd::Cancelled | SessionEnd::Closed => {
                info!(receiver = %self.id, "Receiver stopped");
            }
            SessionEnd::Failed(e) => {
                error!(receiver = %self.id, error = %e, "Consumer failed");
                self.report_fatal(e.to_string());
            }
            SessionEnd::Undelivered {
                topic,
                partition,
                offset,
            } => self.reconnect(topic, partition, offset),
        }
    }

    async fn process(&self, source: &dyn Source, record: Record) -> Result<(), SessionEnd> {
        let topic = record.topic.clone();
        let partition = record.partition;
        let offset = record.offset;
        let undelivered = || SessionEnd::Undelivered {
            topic: topic.clone(),
            partition,
            offset,
        };

        let msg = record.into_message();
        let metrics = DeliveryMetrics::start(&topic, partition, msg.size());

        if let Err(e) = self.sender.send(&msg).await {
            metrics.record("error");
            let status = match &e {
                DeliveryError::Status(s) => s.as_str(),
                _ => "",
            };
            warn!(
                receiver = %self.id,
                topic = %topic,
                partition,
                offset,
                status = %status,
                error = %e,
                "Callback delivery failed"
            );
            return Err(undelivered());
        }
        metrics.record("ok");

        if let Err(e) = source.commit(&topic, partition, offset).await {
            warn!(
                receiver = %self.id,
                topic = %topic,
                partition,
                offset,
                error = %e,
                "Offset commit failed"
            );
            return Err(undelivered());
        }

        debug!(
            receiver = %self.id,
            topic = %topic,
            partition,
            offset,
            "Delivered"
        );
        Ok(())
    }

    fn reconnect(self: Arc<Self>, topic: String, partition: i32, offset: i64) {
        if self.cancel.is_cancelled() {
            return;
        }

        let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.restart.allows(attempt) {
            self.report_fatal(format!("gave up after {} restarts", attempt - 1));
            return;
        }
        let delay = self.restart.delay(attempt);

        warn!(
            receiver = %self.id,
            topic = %topic,
            partition,
            offset,
            attempt,
            delay_secs = delay.as_secs_f64(),
            "Reconnecting"
        );

        let tracker = self.tracker.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(receiver = %self.id, "Reconnect abandoned");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let result = match self.connect().await {
                Ok(()) => self.listen().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if self.cancel.is_cancelled() {
                    return;
                }
                error!(receiver = %self.id, error = %e, "Reconnect failed");
                self.report_fatal(e.to_string());
            }
        });
    }

    fn report_fatal(&self, reason: String) {
        let _ = self.fatal.send(Fatal {
            receiver: self.id.clone(),
            reason,
        });
    }
}
