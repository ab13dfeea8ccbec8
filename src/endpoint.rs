//! Broker endpoint descriptors.
//!
//! A broker is addressed by a connection string of the form
//! `scheme://host:port`, where the scheme is a `_`-joined list of security
//! tokens (`sasl`, `ssl`) and the port defaults to 9092. Any other token is
//! rejected.
//!
//! # Example
//!
//! ```rust
//! use melp::endpoint::{EndpointDescriptor, SecurityProtocol};
//!
//! let ep = EndpointDescriptor::new("sasl_ssl://kafka.example.com:9093", "user", "secret");
//! assert!(ep.error().is_none());
//! assert_eq!(ep.peers(), vec!["kafka.example.com:9093".to_string()]);
//! assert_eq!(ep.security_protocol(), SecurityProtocol::SaslSsl);
//! ```

use rdkafka::config::ClientConfig;

use crate::error::ConfigError;

/// Default broker port when the connection string has none.
pub const DEFAULT_PORT: u16 = 9092;

/// Security protocol for the broker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// No encryption or authentication.
    #[default]
    Plaintext,
    /// TLS encryption without SASL.
    Ssl,
    /// SASL authentication without TLS.
    SaslPlaintext,
    /// SASL authentication with TLS encryption.
    SaslSsl,
}

impl SecurityProtocol {
    /// Returns the librdkafka configuration string for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }
}

/// Parsed broker connection string plus credentials.
///
/// Parse failures are stored rather than raised so that validation can
/// report every problem of a unit at once.
#[derive(Debug, Clone, Default)]
pub struct EndpointDescriptor {
    raw: String,
    key: String,
    secret: String,
    host: String,
    port: u16,
    ssl: bool,
    sasl: bool,
    error: Option<ConfigError>,
}

impl EndpointDescriptor {
    /// Parses `raw` and attaches the SASL credentials.
    pub fn new(raw: &str, key: &str, secret: &str) -> Self {
        match Self::parse(raw) {
            Ok(mut ep) => {
                ep.key = key.to_string();
                ep.secret = secret.to_string();
                ep
            }
            Err(e) => Self {
                raw: raw.to_string(),
                key: key.to_string(),
                secret: secret.to_string(),
                error: Some(e),
                ..Default::default()
            },
        }
    }

    /// Placeholder for a reference to an undeclared endpoint name.
    pub fn unresolved(name: &str) -> Self {
        Self {
            raw: name.to_string(),
            error: Some(ConfigError::EndpointNotFound(name.to_string())),
            ..Default::default()
        }
    }

    /// Parses a `scheme://host:port` connection string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Required` for an empty string,
    /// `ConfigError::EndpointInvalidPort` for a non-numeric port,
    /// `ConfigError::EndpointMissingHost` for an empty host or zero port and
    /// `ConfigError::EndpointInvalidScheme` for an unknown scheme token.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Err(ConfigError::Required("endpoint".to_string()));
        }

        let (scheme, hostport) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("", raw),
        };

        let (host, port) = match hostport.split_once(':') {
            Some((host, "")) => (host, DEFAULT_PORT),
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::EndpointInvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (hostport, DEFAULT_PORT),
        };

        if host.is_empty() || port == 0 {
            return Err(ConfigError::EndpointMissingHost);
        }

        let mut ep = Self {
            raw: raw.to_string(),
            host: host.to_string(),
            port,
            ..Default::default()
        };

        if !scheme.is_empty() {
            for token in scheme.split('_') {
                match token.to_ascii_uppercase().as_str() {
                    "SASL" => ep.sasl = true,
                    "SSL" => ep.ssl = true,
                    _ => return Err(ConfigError::EndpointInvalidScheme(token.to_string())),
                }
            }
        }

        Ok(ep)
    }

    /// The connection string as configured.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Broker host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether TLS is enabled.
    pub fn ssl(&self) -> bool {
        self.ssl
    }

    /// Whether SASL authentication is enabled.
    pub fn sasl(&self) -> bool {
        self.sasl
    }

    /// Stored parse error, if any.
    pub fn error(&self) -> Option<&ConfigError> {
        self.error.as_ref()
    }

    /// Bootstrap peer addresses (a single `host:port`).
    pub fn peers(&self) -> Vec<String> {
        vec![format!("{}:{}", self.host, self.port)]
    }

    /// Security protocol implied by the scheme tokens.
    pub fn security_protocol(&self) -> SecurityProtocol {
        match (self.sasl, self.ssl) {
            (true, true) => SecurityProtocol::SaslSsl,
            (true, false) => SecurityProtocol::SaslPlaintext,
            (false, true) => SecurityProtocol::Ssl,
            (false, false) => SecurityProtocol::Plaintext,
        }
    }

    /// Returns the stored parse error, or a missing credential error when
    /// SASL is enabled without key/secret.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if self.sasl {
            if self.key.is_empty() {
                return Err(ConfigError::Required("key".to_string()));
            }
            if self.secret.is_empty() {
                return Err(ConfigError::Required("secret".to_string()));
            }
        }
        Ok(())
    }

    /// Sets bootstrap servers, security protocol and SASL/PLAIN credentials
    /// on a client configuration.
    pub fn apply_security(&self, config: &mut ClientConfig) {
        config.set("bootstrap.servers", self.peers().join(","));
        config.set("security.protocol", self.security_protocol().as_str());

        if self.sasl {
            config.set("sasl.mechanism", "PLAIN");
            config.set("sasl.username", &self.key);
            config.set("sasl.password", &self.secret);
        }
    }
}
