//! Transport configuration.
//!
//! Configuration is built once and frozen when the [`Transport`](crate::Transport)
//! is constructed. Values can be layered from the environment using the same
//! prefix convention DogRS applications use for their own settings:
//!
//! ```bash
//! export DOG_TRANSPORT__AUTHORIZATION_ENDPOINT=https://policy.example.com/post-policy
//! export DOG_TRANSPORT__TIMEOUT_MS=30000
//! ```

use std::time::Duration;

use crate::{FieldMap, FieldValue, TransportError, TransportResult};

/// Default inactivity timeout (2 minutes)
pub const DEFAULT_TIMEOUT_MS: u64 = 2 * 60 * 1000;

/// Default timeout for the authorization handshake
pub const DEFAULT_AUTHORIZATION_TIMEOUT_MS: u64 = 30 * 1000;

/// Configuration for a transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Fallback upload server when the policy does not name one
    pub server_url: String,

    /// Endpoint issuing signed upload policies
    pub authorization_endpoint: String,

    /// HTTP method used by the runtime send
    pub http_method: String,

    /// Include cross-origin credentials (runtime-dependent)
    pub allow_credentials: bool,

    /// Form field name the file part is sent under
    pub file_field_name: String,

    /// Inactivity timeout in milliseconds; 0 disables supervision
    pub timeout_ms: u64,

    /// Handshake timeout in milliseconds; 0 waits forever
    pub authorization_timeout_ms: u64,

    /// Form fields every attempt starts with
    pub initial_form_fields: FieldMap,

    /// Headers every attempt starts with
    pub initial_headers: FieldMap,

    /// Send the blob as the raw request body instead of multipart
    pub send_as_binary: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            authorization_endpoint: String::new(),
            http_method: "POST".to_string(),
            allow_credentials: false,
            file_field_name: "file".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            authorization_timeout_ms: DEFAULT_AUTHORIZATION_TIMEOUT_MS,
            initial_form_fields: FieldMap::new(),
            initial_headers: FieldMap::new(),
            send_as_binary: false,
        }
    }
}

impl TransportConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer `{prefix}KEY` environment variables over the defaults
    pub fn from_env(prefix: &str) -> TransportResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Layer an arbitrary set of variables over the defaults
    pub fn from_vars<I>(prefix: &str, vars: I) -> TransportResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(prefix) else {
                continue;
            };

            match name.to_ascii_uppercase().as_str() {
                "SERVER_URL" => config.server_url = value,
                "AUTHORIZATION_ENDPOINT" => config.authorization_endpoint = value,
                "HTTP_METHOD" => config.http_method = value.to_ascii_uppercase(),
                "ALLOW_CREDENTIALS" => config.allow_credentials = parse_var(&key, &value)?,
                "FILE_FIELD_NAME" => config.file_field_name = value,
                "TIMEOUT_MS" => config.timeout_ms = parse_var(&key, &value)?,
                "AUTHORIZATION_TIMEOUT_MS" => {
                    config.authorization_timeout_ms = parse_var(&key, &value)?
                }
                "SEND_AS_BINARY" => config.send_as_binary = parse_var(&key, &value)?,
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn with_server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_authorization_endpoint<S: Into<String>>(mut self, url: S) -> Self {
        self.authorization_endpoint = url.into();
        self
    }

    pub fn with_http_method<S: Into<String>>(mut self, method: S) -> Self {
        self.http_method = method.into().to_ascii_uppercase();
        self
    }

    pub fn allow_credentials(mut self) -> Self {
        self.allow_credentials = true;
        self
    }

    pub fn with_file_field_name<S: Into<String>>(mut self, name: S) -> Self {
        self.file_field_name = name.into();
        self
    }

    /// Set the inactivity timeout; 0 disables it
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Set the authorization handshake timeout; 0 disables it
    pub fn with_authorization_timeout_ms(mut self, ms: u64) -> Self {
        self.authorization_timeout_ms = ms;
        self
    }

    pub fn with_form_field<K: Into<String>, V: Into<FieldValue>>(mut self, key: K, value: V) -> Self {
        self.initial_form_fields.set(key, value);
        self
    }

    pub fn with_header<K: Into<String>, V: Into<FieldValue>>(mut self, key: K, value: V) -> Self {
        self.initial_headers.set(key, value);
        self
    }

    pub fn send_as_binary(mut self) -> Self {
        self.send_as_binary = true;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn authorization_timeout(&self) -> Option<Duration> {
        (self.authorization_timeout_ms > 0)
            .then(|| Duration::from_millis(self.authorization_timeout_ms))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> TransportResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| TransportError::invalid(format!("Cannot parse {} = {:?}", key, value)))
}
