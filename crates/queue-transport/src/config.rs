//! Transport configuration.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. built-in defaults
//! 2. an optional configuration file (TOML, YAML or JSON by extension)
//! 3. environment variables prefixed `QUEUE_TRANSPORT`, with `__` separating
//!    nested keys, e.g. `QUEUE_TRANSPORT__SQS__REGION=eu-west-1`
//!
//! The merged result is validated before it is returned.

use crate::backend::{MAX_BATCH_ENTRIES, MAX_VISIBILITY_TIMEOUT_SECONDS, MAX_WAIT_SECONDS};
use crate::error::ConfigurationError;
use crate::resolver::AddressResolver;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of environment variables read by [`TransportConfig::load`]
pub const ENV_PREFIX: &str = "QUEUE_TRANSPORT";

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address of the queue this endpoint receives from; `None` for send-only
    pub input_queue: Option<String>,

    /// Visibility lease taken on every received message
    pub lease_duration_seconds: u64,

    /// Long-poll wait of one receive call
    pub receive_wait_seconds: u64,

    /// Maximum entries per batch send
    pub max_batch_size: usize,

    /// Create the input queue during initialization
    pub create_queues: bool,

    /// SQS client settings
    pub sqs: SqsSettings,
}

/// SQS client settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsSettings {
    /// AWS region; the SDK default chain is used when unset
    pub region: Option<String>,

    /// Endpoint override, e.g. a local emulator
    pub endpoint_url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            input_queue: None,
            lease_duration_seconds: 30,
            receive_wait_seconds: 1,
            max_batch_size: MAX_BATCH_ENTRIES,
            create_queues: true,
            sqs: SqsSettings::default(),
        }
    }
}

impl TransportConfig {
    /// Create default configuration receiving from `input_queue`
    pub fn for_input_queue(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: Some(input_queue.into()),
            ..Self::default()
        }
    }

    /// Create default send-only configuration
    pub fn send_only() -> Self {
        Self::default()
    }

    /// Load configuration from defaults, an optional file and the environment
    ///
    /// # Errors
    /// Returns [`ConfigurationError::Parsing`] if a source cannot be read or
    /// deserialized, and [`ConfigurationError::Invalid`] if validation fails.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks that:
    /// - the lease duration is between 1 second and 12 hours
    /// - the receive wait is at most 20 seconds
    /// - the batch size is between 1 and 10
    /// - the input queue, if set, is a valid address
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.lease_duration_seconds == 0
            || self.lease_duration_seconds > MAX_VISIBILITY_TIMEOUT_SECONDS
        {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "lease_duration_seconds must be between 1 and {}, got {}",
                    MAX_VISIBILITY_TIMEOUT_SECONDS, self.lease_duration_seconds
                ),
            });
        }

        if self.receive_wait_seconds > MAX_WAIT_SECONDS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "receive_wait_seconds must be at most {}, got {}",
                    MAX_WAIT_SECONDS, self.receive_wait_seconds
                ),
            });
        }

        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_ENTRIES {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "max_batch_size must be between 1 and {}, got {}",
                    MAX_BATCH_ENTRIES, self.max_batch_size
                ),
            });
        }

        if let Some(input) = &self.input_queue {
            AddressResolver::validate(input).map_err(|e| ConfigurationError::Invalid {
                message: format!("input_queue: {}", e),
            })?;
        }

        if let Some(endpoint) = &self.sqs.endpoint_url {
            if !AddressResolver::is_endpoint_url(endpoint) {
                return Err(ConfigurationError::Invalid {
                    message: format!("sqs.endpoint_url is not an http(s) URL: {}", endpoint),
                });
            }
        }

        Ok(())
    }

    /// Lease duration as a [`Duration`]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    /// Receive wait as a [`Duration`]
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_seconds)
    }
}
