//! HTTP callback delivery.
//!
//! A [`CallbackSender`] forwards one [`Message`] to a configured
//! [`CallbackTarget`] as an HTTP `POST`, with per-send retry.
//!
//! Headers are composed in a fixed order, later entries winning on
//! conflicting names:
//!
//! 1. `Authorization` from the target's [`Auth`]
//! 2. `User-Agent: melp-<version>`
//! 3. static headers from the target
//! 4. message metadata under the provenance prefix (`x-offset`, ...)
//! 5. message headers
//!
//! # Example
//!
//! ```rust,no_run
//! use melp::callback::{CallbackSender, CallbackTarget};
//! use melp::message::Message;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let target = CallbackTarget {
//!     url: "http://localhost:8080/hook/%{topic}".to_string(),
//!     ..Default::default()
//! };
//! let sender = CallbackSender::new(target, "x-")?;
//!
//! let mut msg = Message::new(r#"{"x":1}"#);
//! msg.add_metadata("topic", "orders");
//! sender.send(&msg).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::auth::Auth;
use crate::error::{ConfigError, DeliveryError};
use crate::message::Message;
use crate::retry::RetryPolicy;

/// Client identification sent with every callback.
pub const USER_AGENT: &str = concat!("melp-", env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how a receiver delivers its messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackTarget {
    /// URL template; `%{key}` is replaced by the message metadata value
    pub url: String,

    /// Outbound authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,

    /// Static headers added to every request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl CallbackTarget {
    /// Checks the URL is present and resolves the outbound auth mode.
    pub fn validate(&mut self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.url.trim().is_empty() {
            errors.push(ConfigError::Required("callback.url".to_string()));
        }
        if let Some(auth) = self.auth.as_mut() {
            auth.normalize();
            if let Err(e) = auth.resolve_outbound() {
                errors.push(e);
            }
        }
        errors
    }
}

/// A fully composed request, before it hits the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Destination with all placeholders substituted
    pub url: Url,
    /// Final header set, keyed by lower-case name
    pub headers: BTreeMap<String, String>,
}

/// Delivers messages to one callback target.
#[derive(Debug, Clone)]
pub struct CallbackSender {
    client: Client,
    target: CallbackTarget,
    metadata_prefix: String,
    placeholder: Regex,
    policy: RetryPolicy,
}

impl CallbackSender {
    /// Creates a sender for `target`.
    ///
    /// # Arguments
    ///
    /// * `target` - Callback URL, auth and static headers
    /// * `metadata_prefix` - Prefix for provenance headers, e.g. `x-`
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Transport` if the HTTP client cannot be built.
    pub fn new(target: CallbackTarget, metadata_prefix: &str) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let placeholder =
            Regex::new(r"%\{([^}]*)\}").map_err(|e| DeliveryError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            target,
            metadata_prefix: metadata_prefix.to_ascii_lowercase(),
            placeholder,
            policy: RetryPolicy::callback(),
        })
    }

    /// Replaces the per-send retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The configured target.
    pub fn target(&self) -> &CallbackTarget {
        &self.target
    }

    /// Substitutes `%{key}` placeholders from `metadata`.
    ///
    /// Returns the expanded string and the keys that had no value.
    fn expand_url(&self, metadata: &BTreeMap<String, String>) -> (String, Vec<String>) {
        let mut missing = Vec::new();
        let expanded = self
            .placeholder
            .replace_all(&self.target.url, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                match metadata.get(key) {
                    Some(value) => value.clone(),
                    None => {
                        missing.push(key.to_string());
                        String::new()
                    }
                }
            })
            .into_owned();
        (expanded, missing)
    }

    /// Composes the URL and headers for `msg`.
    ///
    /// Pure: the same target and message always produce the same request.
    /// Headers that are not valid HTTP are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidUrl` if the substituted URL does not
    /// parse.
    pub fn build_request(&self, msg: &Message) -> Result<PreparedRequest, DeliveryError> {
        let (raw_url, missing) = self.expand_url(&msg.metadata);
        if !missing.is_empty() {
            warn!(
                url = %self.target.url,
                missing = %missing.join(","),
                "Callback URL references unknown metadata"
            );
        }
        let url = Url::parse(&raw_url)
            .map_err(|e| DeliveryError::InvalidUrl(format!("{}: {}", raw_url, e)))?;

        let mut headers = BTreeMap::new();
        if let Some(value) = self.target.auth.as_ref().and_then(Auth::outbound_header) {
            headers.insert("authorization".to_string(), value);
        }
        headers.insert("user-agent".to_string(), USER_AGENT.to_string());
        for (k, v) in &self.target.headers {
            headers.insert(k.to_ascii_lowercase(), v.clone());
        }
        for (k, v) in &msg.metadata {
            headers.insert(
                format!("{}{}", self.metadata_prefix, k.to_ascii_lowercase()),
                v.clone(),
            );
        }
        for (k, v) in &msg.headers {
            headers.insert(k.to_ascii_lowercase(), v.clone());
        }

        // a header HTTP cannot carry must not block the rest of the partition
        headers.retain(|name, value| {
            let valid = HeaderName::from_bytes(name.as_bytes()).is_ok()
                && HeaderValue::from_str(value).is_ok();
            if !valid {
                warn!(url = %url, header = %name, "Dropping header that is not valid HTTP");
            }
            valid
        });

        Ok(PreparedRequest { url, headers })
    }

    /// Delivers `msg`, retrying transport errors, 429 and 5xx (except 501).
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidUrl` without any network call when the
    /// URL is malformed, `DeliveryError::Status` with the status text for a
    /// final non-2xx answer and `DeliveryError::Transport` when the last
    /// attempt failed below HTTP.
    pub async fn send(&self, msg: &Message) -> Result<(), DeliveryError> {
        let prepared = self.build_request(msg)?;
        let headers = to_header_map(&prepared.headers);

        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .post(prepared.url.clone())
                .headers(headers.clone())
                .body(msg.body.clone())
                .send()
                .await;

            let retryable = match &result {
                Ok(response) => is_retryable(response.status()),
                Err(_) => true,
            };

            attempt += 1;
            if !retryable || !self.policy.allows(attempt) {
                return match result {
                    Ok(response) if response.status().is_success() => Ok(()),
                    Ok(response) => Err(DeliveryError::Status(response.status().to_string())),
                    Err(e) => Err(DeliveryError::Transport(e)),
                };
            }

            let delay = self.policy.delay(attempt);
            debug!(
                url = %prepared.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying callback"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    headers
        .iter()
        .filter_map(|(k, v)| {
            let name = HeaderName::from_bytes(k.as_bytes()).ok()?;
            let value = HeaderValue::from_str(v).ok()?;
            Some((name, value))
        })
        .collect()
}
