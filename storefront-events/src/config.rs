//! Bus configuration.
//!
//! Selects the transport and carries the settings of both backends. Values
//! are loaded from environment variables with defaults suitable for local
//! development.

use crate::bus::TransportMode;
use crate::retry::RetryConfig;
use crate::signature::{SignatureVerifier, SigningKey};
use crate::types::Topic;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Complete bus configuration for one service process.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Which transport to run.
    pub mode: TransportMode,

    /// Name of the owning service; default consumer group.
    pub service_name: String,

    /// Log backend settings.
    pub log: LogConfig,

    /// Relay backend settings.
    pub relay: RelayConfig,

    /// Inbound webhook settings (relay mode).
    pub webhook: WebhookConfig,
}

/// Log backend settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,

    /// Client identifier reported to the broker.
    pub client_id: String,

    /// Consumer group of this service.
    pub group_id: String,

    /// Replay retained history when the group has no committed offset.
    pub from_beginning: bool,

    /// Budget for reaching the broker in `connect()`.
    pub connect_retry: RetryConfig,

    /// Attempts per record before it is given up on.
    pub handler_retry: RetryConfig,

    /// Move records whose handler keeps failing to `<topic>.dlq`.
    pub dead_letter: bool,

    /// Producer delivery timeout.
    pub send_timeout: Duration,
}

/// Relay backend settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay API base URL.
    pub base_url: String,

    /// Bearer token for the relay API.
    pub token: Option<String>,

    /// Delivery attempts the relay makes per message.
    pub retries: u32,

    /// Public base URL of this deployment's webhook endpoints.
    pub callback_base_url: Option<String>,

    /// Per-topic destination URLs overriding `callback_base_url`.
    pub destinations: HashMap<Topic, String>,

    /// Timeout for calls to the relay API.
    pub request_timeout: Duration,
}

impl RelayConfig {
    /// Callback URL the relay should deliver `topic` to, if one is known.
    pub fn destination_for(&self, topic: Topic) -> Option<String> {
        if let Some(url) = self.destinations.get(&topic) {
            return Some(url.clone());
        }
        self.callback_base_url.as_ref().map(|base| {
            format!("{}/qstash/{}", base.trim_end_matches('/'), topic.as_str())
        })
    }

    /// Full URL of a relay API path.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }
}

/// Inbound webhook settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Listen port.
    pub port: u16,

    /// Current relay signing key.
    pub signing_key: Option<String>,

    /// Next relay signing key, accepted during rotation.
    pub next_signing_key: Option<String>,

    /// Budget for a handler to finish before the request fails.
    pub handler_timeout: Duration,
}

impl WebhookConfig {
    /// Build the signature verifier for these keys.
    pub fn verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(
            self.signing_key.clone().map(SigningKey::from),
            self.next_signing_key.clone().map(SigningKey::from),
        )
    }
}

impl BusConfig {
    /// Defaults for local development.
    pub fn local(service_name: impl Into<String>, port: u16) -> Self {
        let service_name = service_name.into();
        Self {
            mode: TransportMode::Log,
            log: LogConfig {
                brokers: "localhost:9094".to_string(),
                client_id: service_name.clone(),
                group_id: service_name.clone(),
                from_beginning: true,
                connect_retry: RetryConfig::connect(),
                handler_retry: RetryConfig::handler(),
                dead_letter: true,
                send_timeout: Duration::from_secs(5),
            },
            relay: RelayConfig {
                base_url: "https://qstash.upstash.io".to_string(),
                token: None,
                retries: 3,
                callback_base_url: None,
                destinations: HashMap::new(),
                request_timeout: Duration::from_secs(10),
            },
            webhook: WebhookConfig {
                port,
                signing_key: None,
                next_signing_key: None,
                handler_timeout: Duration::from_secs(25),
            },
            service_name,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MESSAGE_BUS` (or `KAFKA_MODE`): `kafka`/`log` or `qs`/`relay` (default: kafka)
    /// - `KAFKA_BROKERS`: bootstrap servers (default: localhost:9094)
    /// - `KAFKA_CLIENT_ID`: client id (default: hostname)
    /// - `KAFKA_GROUP_ID`: consumer group (default: service name)
    /// - `BUS_CONNECT_ATTEMPTS`: connect retry budget (default: 5)
    /// - `BUS_HANDLER_ATTEMPTS`: attempts per record (default: 3)
    /// - `BUS_DEAD_LETTER`: dead-letter failing records (default: true)
    /// - `QSTASH_URL`: relay base URL (default: https://qstash.upstash.io)
    /// - `QSTASH_TOKEN`: relay API token
    /// - `QSTASH_RETRIES`: relay delivery attempts (default: 3)
    /// - `QSTASH_CALLBACK_URL`: public base URL of this service
    /// - `QSTASH_SIGNING_KEY` / `QSTASH_NEXT_SIGNING_KEY`: webhook signing keys
    /// - `WEBHOOK_TIMEOUT_SECS`: handler timeout (default: 25)
    /// - `PORT`: webhook listen port
    pub fn from_env(service_name: &str, default_port: u16) -> Result<Self, ConfigError> {
        Self::from_lookup(service_name, default_port, |key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(service_name: &str, default_port: u16, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::local(service_name, default_port);

        if let Some(mode) = lookup("MESSAGE_BUS").or_else(|| lookup("KAFKA_MODE")) {
            config.mode = mode.parse().map_err(|message| ConfigError::InvalidValue {
                key: "MESSAGE_BUS".to_string(),
                message,
            })?;
        }

        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            config.log.brokers = brokers;
        }
        config.log.client_id = lookup("KAFKA_CLIENT_ID").unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| service_name.to_string())
        });
        if let Some(group) = lookup("KAFKA_GROUP_ID") {
            config.log.group_id = group;
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "BUS_CONNECT_ATTEMPTS")? {
            config.log.connect_retry = config.log.connect_retry.with_max_attempts(attempts);
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "BUS_HANDLER_ATTEMPTS")? {
            config.log.handler_retry = config.log.handler_retry.with_max_attempts(attempts);
        }
        if let Some(flag) = lookup("BUS_DEAD_LETTER") {
            config.log.dead_letter = flag != "false" && flag != "0";
        }

        if let Some(url) = lookup("QSTASH_URL") {
            config.relay.base_url = url;
        }
        config.relay.token = lookup("QSTASH_TOKEN");
        if let Some(retries) = parse_var::<u32, _>(&lookup, "QSTASH_RETRIES")? {
            config.relay.retries = retries;
        }
        config.relay.callback_base_url = lookup("QSTASH_CALLBACK_URL");

        config.webhook.signing_key = lookup("QSTASH_SIGNING_KEY");
        config.webhook.next_signing_key = lookup("QSTASH_NEXT_SIGNING_KEY");
        if let Some(secs) = parse_var::<u64, _>(&lookup, "WEBHOOK_TIMEOUT_SECS")? {
            config.webhook.handler_timeout = Duration::from_secs(secs);
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "PORT")? {
            config.webhook.port = port;
        }

        Ok(config)
    }

    /// Validate that all required configuration is present for production.
    ///
    /// The relay transport needs an API token to publish and a signing key so
    /// webhook verification is not bypassed.
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.mode == TransportMode::Relay {
            if self.relay.token.is_none() {
                return Err(ConfigError::MissingEnvVar("QSTASH_TOKEN".to_string()));
            }
            if self.webhook.signing_key.is_none() {
                return Err(ConfigError::MissingEnvVar("QSTASH_SIGNING_KEY".to_string()));
            }
        }
        if self.mode == TransportMode::Log && self.log.brokers.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("KAFKA_BROKERS".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}
