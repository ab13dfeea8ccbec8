//! Inbound and outbound HTTP authentication.
//!
//! [`Auth`] guards the `/send/{id}` endpoints of producers and supplies the
//! `Authorization` header for receiver callbacks. At most one mode among
//! anonymous, bearer and basic is active.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ConfigError};

/// Authentication settings, shared by producers (inbound) and callbacks
/// (outbound).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Auth {
    /// Reject every request after successful authentication
    #[serde(default)]
    pub fail: bool,

    /// Accept requests without credentials
    #[serde(default, rename = "anon")]
    pub anonymous: bool,

    /// Expected (inbound) or presented (outbound) bearer token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bearer: String,

    /// Basic credentials, username to password
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub basic: BTreeMap<String, String>,
}

/// The active authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No credentials required or sent
    Anonymous,
    /// Bearer token
    Bearer,
    /// Basic username/password
    Basic,
}

impl Auth {
    /// Anonymous auth, accepting everything.
    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            ..Default::default()
        }
    }

    /// Bearer token auth.
    pub fn bearer(token: &str) -> Self {
        Self {
            bearer: token.to_string(),
            ..Default::default()
        }
    }

    /// Basic auth with a single credential pair.
    pub fn basic(username: &str, password: &str) -> Self {
        let mut basic = BTreeMap::new();
        basic.insert(username.to_string(), password.to_string());
        Self {
            basic,
            ..Default::default()
        }
    }

    /// Drops basic entries whose username or password is empty, which
    /// happens when they were built from unset environment variables.
    pub fn normalize(&mut self) {
        self.basic
            .retain(|user, pass| !user.is_empty() && !pass.is_empty());
    }

    /// Returns the configured mode, or an error if none or several are set.
    ///
    /// Used for producers, where an explicit choice is required.
    pub fn mode(&self) -> Result<AuthMode, ConfigError> {
        let bearer = !self.bearer.is_empty();
        let basic = !self.basic.is_empty();
        match (self.anonymous, bearer, basic) {
            (true, false, false) => Ok(AuthMode::Anonymous),
            (false, true, false) => Ok(AuthMode::Bearer),
            (false, false, true) => Ok(AuthMode::Basic),
            (false, false, false) => Err(ConfigError::AuthModeRequired),
            _ => Err(ConfigError::ConflictingAuth),
        }
    }

    /// Validates outbound settings: bearer and basic are mutually exclusive,
    /// and a block with neither becomes anonymous.
    pub fn resolve_outbound(&mut self) -> Result<(), ConfigError> {
        if !self.bearer.is_empty() && !self.basic.is_empty() {
            return Err(ConfigError::ConflictingAuth);
        }
        self.anonymous = self.bearer.is_empty() && self.basic.is_empty();
        Ok(())
    }

    /// Validates the `Authorization` header of an inbound request.
    ///
    /// # Arguments
    ///
    /// * `authorization` - The raw header value, if the request carried one
    ///
    /// # Errors
    ///
    /// Returns the matching [`AuthError`]; `AuthError::ForcedFail` when the
    /// credentials were fine but `fail` is set.
    pub fn validate(&self, authorization: Option<&str>) -> Result<(), AuthError> {
        self.verify_authorization(authorization)?;
        if self.fail {
            return Err(AuthError::ForcedFail);
        }
        Ok(())
    }

    fn verify_authorization(&self, authorization: Option<&str>) -> Result<(), AuthError> {
        if self.anonymous {
            return Ok(());
        }

        let header = match authorization {
            Some(h) if !h.is_empty() => h,
            _ => return Err(AuthError::Required),
        };

        let (scheme, credential) = header.split_once(' ').ok_or(AuthError::Malformed)?;

        match scheme.to_ascii_lowercase().as_str() {
            "basic" => {
                let decoded = STANDARD
                    .decode(credential)
                    .map_err(|_| AuthError::InvalidBasic)?;
                let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidBasic)?;
                let (user, pass) = decoded.split_once(':').ok_or(AuthError::InvalidBasic)?;
                match self.basic.get(user) {
                    Some(expected) if expected == pass => Ok(()),
                    _ => Err(AuthError::UnknownUser),
                }
            }
            "bearer" => {
                if !self.bearer.is_empty() && credential == self.bearer {
                    Ok(())
                } else {
                    Err(AuthError::InvalidBearer)
                }
            }
            _ => Err(AuthError::Malformed),
        }
    }

    /// Builds the outbound `Authorization` header value.
    ///
    /// Bearer wins over basic. With several basic pairs only the last one in
    /// username order is used.
    pub fn outbound_header(&self) -> Option<String> {
        if !self.bearer.is_empty() {
            return Some(format!("Bearer {}", self.bearer));
        }
        let (user, pass) = self.basic.iter().last()?;
        let encoded = STANDARD.encode(format!("{}:{}", user, pass));
        Some(format!("Basic {}", encoded))
    }
}
