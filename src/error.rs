//! Error types for melp
//!
//! This module defines the error taxonomy used throughout the bridge,
//! using `thiserror` for ergonomic error handling. Each family maps to
//! one failure domain:
//!
//! - [`ConfigError`]: invalid or incomplete configuration, aggregated per unit
//! - [`ConnectError`]: the broker could not be reached or rejected the client
//! - [`DeliveryError`]: a callback could not be delivered
//! - [`AuthError`]: an inbound HTTP request was rejected
//! - [`ProduceError`]: the broker rejected a publish

use thiserror::Error;

/// Configuration errors.
///
/// Cloneable so that a parse failure can be stored on a descriptor and
/// reported later together with every other violation of the same unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field is missing or empty
    #[error("'{0}' is required")]
    Required(String),

    /// A field holds a value that cannot be used
    #[error("'{0}' is invalid")]
    Invalid(String),

    /// Broker connection string has no host or a zero port
    #[error("'endpoint' is missing host and/or port")]
    EndpointMissingHost,

    /// Broker connection string carries an unknown scheme token
    #[error("'endpoint' is invalid: unknown scheme '{0}'")]
    EndpointInvalidScheme(String),

    /// Broker connection string carries a non-numeric port
    #[error("'endpoint' has an invalid port: {0}")]
    EndpointInvalidPort(String),

    /// A unit references a broker endpoint that is not declared
    #[error("endpoint '{0}' not found")]
    EndpointNotFound(String),

    /// Two enabled producers share the same ID
    #[error("duplicate producer id '{0}'")]
    DuplicateId(String),

    /// Both bearer and basic configured where only one is allowed
    #[error("can't use both 'bearer' and 'basic' auth")]
    ConflictingAuth,

    /// No auth mode configured where one is required
    #[error("'auth' must have either 'anon' or 'bearer/basic'")]
    AuthModeRequired,

    /// Environment variables referenced by the file are not set
    #[error("unable to expand: {}", .0.join(", "))]
    UnresolvedVariables(Vec<String>),

    /// The configuration file could not be read
    #[error("unable to load config: {0}")]
    Read(String),

    /// The configuration file could not be parsed
    #[error("unable to parse config: {0}")]
    Parse(String),
}

/// Errors raised while opening a broker client.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The broker client library refused the configuration or connection
    #[error("broker connection failed: {0}")]
    Broker(String),

    /// The unit failed validation and can't be connected
    #[error("unit '{0}' is not valid")]
    Invalid(String),

    /// The source closed before its first session became ready
    #[error("receiver '{0}' closed before the session became ready")]
    SessionLost(String),
}

/// Errors raised while delivering a message to a callback.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The substituted URL could not be parsed; no request was issued
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The request failed at the transport level after all retries
    #[error("send failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The callback answered with a non-2xx status after all retries
    #[error("{0}")]
    Status(String),
}

/// Inbound authentication failures, surfaced as HTTP 401.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No Authorization header present
    #[error("Authorization-header is missing")]
    Required,

    /// Authorization header is not `<scheme> <credential>` or the scheme is unknown
    #[error("Authorization-header is mal-formed")]
    Malformed,

    /// Basic credential is not valid base64 or has no `:`
    #[error("'Auth-Basic' is invalid")]
    InvalidBasic,

    /// Basic credential names an unknown user or wrong password
    #[error("unknown user")]
    UnknownUser,

    /// Bearer token does not match
    #[error("'Auth-Bearer' is invalid")]
    InvalidBearer,

    /// The operator forced all requests to fail
    #[error("forced-fail")]
    ForcedFail,
}

/// Errors raised while publishing to the broker.
#[derive(Error, Debug)]
pub enum ProduceError {
    /// The producer has not been connected or was closed
    #[error("producer '{0}' is not connected")]
    NotConnected(String),

    /// The broker rejected or timed out the publish
    #[error("publish failed: {0}")]
    Broker(String),
}

/// Errors reported by a consumer-group source while listening.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The consumer group was closed; the listen loop should end quietly
    #[error("consumer group was closed")]
    Closed,

    /// Any other client error, fatal to the process
    #[error("consumer error: {0}")]
    Broker(String),
}

/// Result type alias for top-level glue code.
pub type Result<T> = anyhow::Result<T>;
