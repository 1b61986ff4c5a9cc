//! Realtime endpoint derivation.
//!
//! The channel always lives at a fixed path on the page's own host in
//! production, and on a fixed local host during development. The scheme
//! follows the page: a page served over `https` talks `wss`.

use std::fmt;

use thiserror::Error;

/// Default development host, where the storefront backend runs locally.
pub const DEFAULT_DEV_HOST: &str = "localhost:5000";

/// Default realtime path.
pub const DEFAULT_PATH: &str = "/ws";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("origin `{0}` has no scheme (expected e.g. https://shop.example.com)")]
    MissingScheme(String),
    #[error("origin `{0}` has an unsupported scheme")]
    UnsupportedScheme(String),
    #[error("origin `{0}` has no host")]
    MissingHost(String),
}

/// Where the page was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    secure: bool,
    host: String,
}

impl Origin {
    pub fn new(secure: bool, host: impl Into<String>) -> Self {
        Self {
            secure,
            host: host.into(),
        }
    }

    /// Parse `scheme://host[:port][/...]`. Anything after the authority is ignored.
    pub fn parse(origin: &str) -> Result<Self, EndpointError> {
        let (scheme, rest) = origin
            .split_once("://")
            .ok_or_else(|| EndpointError::MissingScheme(origin.to_string()))?;

        let secure = match scheme.to_ascii_lowercase().as_str() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            _ => return Err(EndpointError::UnsupportedScheme(origin.to_string())),
        };

        let host = rest.split(['/', '?', '#']).next().unwrap_or("");
        if host.is_empty() {
            return Err(EndpointError::MissingHost(origin.to_string()));
        }

        Ok(Self::new(secure, host))
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `wss` for secure pages, `ws` otherwise.
    pub fn ws_scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.host)
    }
}

/// Deployment environment. Decides which host the channel is opened against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    /// Use the page's own host.
    Production,
    /// Use the local development host.
    #[default]
    Development,
}

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Page origin (e.g. `https://shop.example.com`)
    pub origin: String,
    pub environment: Environment,
    /// Host used in [`Environment::Development`]
    pub dev_host: String,
    /// Realtime path on the host
    pub path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            origin: format!("http://{DEFAULT_DEV_HOST}"),
            environment: Environment::Development,
            dev_host: DEFAULT_DEV_HOST.into(),
            path: DEFAULT_PATH.into(),
        }
    }
}

impl EndpointConfig {
    /// Build the final `scheme://host/path` URL.
    pub fn url(&self) -> Result<String, EndpointError> {
        let origin = Origin::parse(&self.origin)?;
        Ok(endpoint_url(&origin, self.environment, &self.dev_host, &self.path))
    }
}

/// Compose the realtime URL for a page origin.
pub fn endpoint_url(origin: &Origin, environment: Environment, dev_host: &str, path: &str) -> String {
    let host = match environment {
        Environment::Production => origin.host(),
        Environment::Development => dev_host,
    };
    let slash = if path.starts_with('/') { "" } else { "/" };
    format!("{}://{host}{slash}{path}", origin.ws_scheme())
}
