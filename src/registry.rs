//! Wiring from validated configuration to live producers and receivers.
//!
//! The [`Registry`] is built once at startup and shared with the HTTP layer.
//! Its producer map never changes after [`Registry::build`]; the
//! [`TaskTracker`] it owns is the shutdown barrier every receiver loop and
//! reconnect task is registered with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::Transport;
use crate::config::Config;
use crate::error::ConfigError;
use crate::producer::Producer;
use crate::receiver::{Fatal, Receiver, ReceiverContext};
use crate::retry::RetryPolicy;

/// Knobs that come from the command line rather than the file.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Receiver restart policy
    pub restart: RetryPolicy,
    /// Callback per-send retry policy
    pub callback_retry: RetryPolicy,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            restart: RetryPolicy::reconnect(Duration::from_secs(15)),
            callback_retry: RetryPolicy::callback(),
        }
    }
}

/// A configuration problem tied to the unit it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
    /// `producer` or `receiver`
    pub kind: &'static str,
    /// Unit id, or its position when the id is missing
    pub unit: String,
    /// The violation
    pub error: ConfigError,
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}': {}", self.kind, self.unit, self.error)
    }
}

/// Live producers and receivers.
#[derive(Debug)]
pub struct Registry {
    producers: HashMap<String, Arc<Producer>>,
    receivers: Vec<Receiver>,
    rejected: Vec<UnitError>,
    transport: Arc<dyn Transport>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    degraded: AtomicBool,
}

impl Registry {
    /// Validates and instantiates every enabled unit.
    ///
    /// Units that fail validation are left out and reported through
    /// [`Registry::rejected`]; their siblings are unaffected.
    ///
    /// # Errors
    ///
    /// Returns the cross-unit violations of [`Config::validate`], such as
    /// duplicate producer ids.
    pub fn build(
        config: &Config,
        transport: Arc<dyn Transport>,
        options: RegistryOptions,
        fatal: mpsc::UnboundedSender<Fatal>,
    ) -> Result<Self, Vec<ConfigError>> {
        config.validate()?;

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let mut rejected = Vec::new();

        let mut producers = HashMap::new();
        for (idx, pc) in config.active_producers().enumerate() {
            let unit = unit_name(&pc.id, idx);
            match Producer::new(pc, config.endpoint(&pc.endpoint)) {
                Ok(p) => {
                    producers.insert(pc.id.clone(), Arc::new(p));
                }
                Err(errors) => rejected.extend(errors.into_iter().map(|error| UnitError {
                    kind: "producer",
                    unit: unit.clone(),
                    error,
                })),
            }
        }

        let ctx = ReceiverContext {
            transport: Arc::clone(&transport),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
            fatal,
            restart: options.restart.clone(),
            callback_retry: options.callback_retry.clone(),
            metadata_prefix: config.server.metadata_header_prefix.clone(),
        };
        let mut receivers = Vec::new();
        for (idx, rc) in config.active_receivers().enumerate() {
            let unit = unit_name(&rc.id, idx);
            match Receiver::new(rc.clone(), config.endpoint(&rc.endpoint), ctx.clone()) {
                Ok(r) => receivers.push(r),
                Err(errors) => rejected.extend(errors.into_iter().map(|error| UnitError {
                    kind: "receiver",
                    unit: unit.clone(),
                    error,
                })),
            }
        }

        for e in &rejected {
            error!(unit = %e.unit, kind = e.kind, error = %e.error, "Invalid configuration");
        }

        Ok(Self {
            producers,
            receivers,
            rejected,
            transport,
            tracker,
            shutdown,
            degraded: AtomicBool::new(false),
        })
    }

    /// Connects every unit. A failing unit is logged and marks the
    /// registry degraded; the others still start.
    ///
    /// Returns `true` when every unit connected.
    pub async fn connect(&self) -> bool {
        for producer in self.producers.values() {
            if let Err(e) = producer.connect(self.transport.as_ref()).await {
                error!(producer = %producer.id(), error = %e, "Producer failed to connect");
                self.degraded.store(true, Ordering::SeqCst);
            }
        }

        for receiver in &self.receivers {
            let result = match receiver.connect().await {
                Ok(()) => receiver.listen().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(receiver = %receiver.id(), error = %e, "Receiver failed to start");
                self.degraded.store(true, Ordering::SeqCst);
            }
        }

        let healthy = !self.is_degraded();
        if healthy {
            info!(
                producers = self.producers.len(),
                receivers = self.receivers.len(),
                "All units connected"
            );
        } else {
            warn!("Started in degraded state");
        }
        healthy
    }

    /// Whether any unit failed to connect.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Units left out because of configuration errors.
    pub fn rejected(&self) -> &[UnitError] {
        &self.rejected
    }

    /// Whether there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.receivers.is_empty()
    }

    /// Looks up a producer by id.
    pub fn producer(&self, id: &str) -> Option<Arc<Producer>> {
        self.producers.get(id).cloned()
    }

    /// Producer ids.
    pub fn producer_ids(&self) -> Vec<&str> {
        self.producers.keys().map(String::as_str).collect()
    }

    /// Live receivers.
    pub fn receivers(&self) -> &[Receiver] {
        &self.receivers
    }

    /// Closes every unit and waits for all receiver loops and pending
    /// reconnects to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        for producer in self.producers.values() {
            producer.close().await;
        }
        for receiver in &self.receivers {
            receiver.close().await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("All units closed");
    }
}

fn unit_name(id: &str, idx: usize) -> String {
    if id.is_empty() {
        format!("#{}", idx)
    } else {
        id.to_string()
    }
}
