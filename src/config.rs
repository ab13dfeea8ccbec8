//! Configuration management for melp
//!
//! This module handles loading, environment substitution, parsing and
//! validation of the YAML configuration file.
//!
//! `${VAR}` references anywhere in the file are replaced by the value of the
//! environment variable `VAR` before parsing. Every unresolved reference is
//! reported; in echo mode the placeholder is rendered as
//! `${VAR !!NOT_FOUND!!}` instead so the operator can see what is missing.
//!
//! Unknown keys are rejected unless the file is loaded relaxed, in which
//! case each one is logged and skipped.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::Auth;
use crate::callback::CallbackTarget;
use crate::endpoint::EndpointDescriptor;
use crate::error::{ConfigError, Result};

/// Main configuration structure for melp
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration schema version
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,

    /// HTTP server behavior
    #[serde(default)]
    pub server: ServerConfig,

    /// Named broker endpoints
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// HTTP-to-broker units
    #[serde(default)]
    pub producers: ProducersConfig,

    /// Broker-to-HTTP units
    #[serde(default)]
    pub consumers: ConsumersConfig,

    /// Optional collectors exposed on `/metrics`
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// How a configuration file is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Render unresolved variables instead of failing
    pub echo: bool,
    /// Skip unknown keys instead of failing
    pub relaxed: bool,
}

fn default_api_version() -> String {
    "v1".to_string()
}

/// HTTP server behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Allow `GET /stop` to shut the process down
    #[serde(default)]
    pub allow_stop: bool,

    /// Prefix for broker provenance headers on callbacks
    #[serde(default = "default_metadata_header_prefix")]
    pub metadata_header_prefix: String,

    /// Prefix marking inbound headers to forward to the broker
    #[serde(default = "default_passthrough_header_prefix")]
    pub passthrough_header_prefix: String,
}

fn default_metadata_header_prefix() -> String {
    "x-".to_string()
}

fn default_passthrough_header_prefix() -> String {
    "melp-".to_string()
}

/// Optional collectors exposed on `/metrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Async runtime gauges (worker threads, live tasks)
    #[serde(default, rename = "go")]
    pub runtime: bool,

    /// Process gauges (start time, uptime)
    #[serde(default)]
    pub process: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allow_stop: false,
            metadata_header_prefix: default_metadata_header_prefix(),
            passthrough_header_prefix: default_passthrough_header_prefix(),
        }
    }
}

/// Named broker endpoints, grouped by broker kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Kafka endpoints
    #[serde(default)]
    pub kafka: Vec<EndpointConfig>,
}

/// A named broker endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Name referenced by producers and consumers
    pub name: String,

    /// Connection string, `scheme://host:port`
    pub endpoint: String,

    /// SASL username
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// SASL password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

/// Producers, grouped by broker kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducersConfig {
    /// Kafka producers
    #[serde(default)]
    pub kafka: Vec<ProducerConfig>,
}

/// An HTTP-to-broker unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Identifier, the `{id}` of `POST /send/{id}`
    pub id: String,

    /// Endpoint name
    pub endpoint: String,

    /// Destination topic
    pub topic: String,

    /// Inbound authentication
    #[serde(default)]
    pub auth: Auth,

    /// Skip this unit entirely
    #[serde(default)]
    pub disabled: bool,
}

/// Consumers, grouped by broker kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumersConfig {
    /// Kafka consumers
    #[serde(default)]
    pub kafka: Vec<ReceiverConfig>,
}

/// A broker-to-HTTP unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Identifier used in logs and the broker client id
    pub id: String,

    /// Endpoint name
    pub endpoint: String,

    /// Subscribed topics
    #[serde(default)]
    pub topics: Vec<String>,

    /// Consumer group
    #[serde(default)]
    pub group: String,

    /// Delivery target
    #[serde(default)]
    pub callback: CallbackTarget,

    /// Skip this unit entirely
    #[serde(default)]
    pub disabled: bool,
}

impl Config {
    /// Load configuration from a file, expanding environment variables
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    /// * `options` - Echo and relaxed parsing switches
    ///
    /// # Returns
    ///
    /// Returns the parsed configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file cannot be read,
    /// `ConfigError::UnresolvedVariables` if a `${VAR}` is not set (unless
    /// `echo`) and `ConfigError::Parse` if the YAML is invalid or, unless
    /// `relaxed`, carries an unknown key.
    pub fn load(path: &str, options: LoadOptions) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(ConfigError::Read(format!("{} not found", path)).into());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path, e)))?;
        let expanded = expand_env(&contents, |name| std::env::var(name).ok(), options.echo)?;
        let mut config = Self::parse_with(&expanded, options.relaxed)?;
        config.apply_env_vars();
        tracing::debug!(path = %path, "Loaded configuration");
        Ok(config)
    }

    /// Parses an already expanded YAML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` on invalid YAML or unknown fields.
    pub fn parse(contents: &str) -> std::result::Result<Self, ConfigError> {
        Self::parse_with(contents, false)
    }

    /// Parses an already expanded YAML document, optionally skipping
    /// unknown keys.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` on invalid YAML, or on the first unknown
    /// key when `relaxed` is false.
    pub fn parse_with(contents: &str, relaxed: bool) -> std::result::Result<Self, ConfigError> {
        let mut unknown = Vec::new();
        let deserializer = serde_yaml::Deserializer::from_str(contents);
        let mut config: Self = serde_ignored::deserialize(deserializer, |path| {
            unknown.push(path.to_string())
        })
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

        if let Some(first) = unknown.first() {
            if !relaxed {
                return Err(ConfigError::Parse(format!("unknown field '{}'", first)));
            }
            for key in &unknown {
                tracing::warn!(key = %key, "Ignoring unknown configuration key");
            }
        }

        for producer in &mut config.producers.kafka {
            producer.auth.normalize();
        }
        for receiver in &mut config.consumers.kafka {
            if let Some(auth) = receiver.callback.auth.as_mut() {
                auth.normalize();
            }
        }
        Ok(config)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(allow_stop) = std::env::var("MELP_ALLOW_STOP") {
            match allow_stop.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.server.allow_stop = true,
                "0" | "false" | "no" => self.server.allow_stop = false,
                _ => tracing::warn!("Invalid MELP_ALLOW_STOP: {}", allow_stop),
            }
        }
    }

    /// Renders the configuration back to YAML.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if serialization fails.
    pub fn to_yaml(&self) -> std::result::Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Resolves an endpoint name to a parsed descriptor.
    ///
    /// An unknown name yields a descriptor carrying
    /// `ConfigError::EndpointNotFound`.
    pub fn endpoint(&self, name: &str) -> EndpointDescriptor {
        self.endpoints
            .kafka
            .iter()
            .find(|e| e.name == name)
            .map(|e| EndpointDescriptor::new(&e.endpoint, &e.key, &e.secret))
            .unwrap_or_else(|| EndpointDescriptor::unresolved(name))
    }

    /// Producers not marked disabled.
    pub fn active_producers(&self) -> impl Iterator<Item = &ProducerConfig> {
        self.producers.kafka.iter().filter(|p| !p.disabled)
    }

    /// Consumers not marked disabled.
    pub fn active_receivers(&self) -> impl Iterator<Item = &ReceiverConfig> {
        self.consumers.kafka.iter().filter(|r| !r.disabled)
    }

    /// Checks cross-unit constraints
    ///
    /// Per-unit validation belongs to [`crate::producer::Producer::validate`]
    /// and [`crate::receiver::Receiver::validate`].
    ///
    /// # Errors
    ///
    /// Returns every violation found: duplicate enabled producer ids and
    /// duplicate endpoint names.
    pub fn validate(&self) -> std::result::Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        let mut names = HashSet::new();
        for endpoint in &self.endpoints.kafka {
            if endpoint.name.is_empty() {
                errors.push(ConfigError::Required("endpoints.kafka.name".to_string()));
            } else if !names.insert(endpoint.name.as_str()) {
                errors.push(ConfigError::Invalid(format!(
                    "endpoint name '{}' declared twice",
                    endpoint.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for producer in self.active_producers() {
            if !producer.id.is_empty() && !ids.insert(producer.id.as_str()) {
                errors.push(ConfigError::DuplicateId(producer.id.clone()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Replaces `${VAR}` references using `lookup`
///
/// # Arguments
///
/// * `contents` - Raw file contents
/// * `lookup` - Variable resolver, usually `std::env::var`
/// * `echo` - Render unresolved references as `${VAR !!NOT_FOUND!!}`
///
/// # Errors
///
/// Returns `ConfigError::UnresolvedVariables` naming every unresolved
/// variable, unless `echo` is set.
///
/// # Examples
///
/// ```
/// use melp::config::expand_env;
///
/// let out = expand_env("topic: ${T}", |_| Some("orders".to_string()), false).unwrap();
/// assert_eq!(out, "topic: orders");
/// ```
pub fn expand_env<F>(
    contents: &str,
    lookup: F,
    echo: bool,
) -> std::result::Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let mut missing = BTreeSet::new();
    let expanded = pattern
        .replace_all(contents, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match lookup(name) {
                Some(value) => value,
                None => {
                    missing.insert(name.to_string());
                    format!("${{{} !!NOT_FOUND!!}}", name)
                }
            }
        })
        .into_owned();

    if !missing.is_empty() && !echo {
        return Err(ConfigError::UnresolvedVariables(
            missing.into_iter().collect(),
        ));
    }
    Ok(expanded)
}
