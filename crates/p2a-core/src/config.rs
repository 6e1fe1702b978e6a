// Copyright 2026-Present the P2A project authors
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

/// Default mean spacing between upload attempts.
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default backoff after the first failed upload.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(60);
/// Cap on the exponential backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);
/// Default bound on buffered histogram notifications.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the reporting pipeline.
///
/// Every knob can be overridden from the environment via `P2A_*`
/// variables; see [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Collection endpoint receiving the base64-encoded reports.
    pub upload_url: String,
    /// Mean interval between upload attempts.
    pub average_upload_interval: Duration,
    /// Draw upload intervals from a geometric distribution instead of
    /// using the mean verbatim. On by default; disabling it is meant for
    /// integration tests only, since deterministic spacing leaks timing.
    pub randomize_upload_interval: bool,
    /// Fixed rotation cadence. `None` aligns rotations to calendar weeks
    /// (next Monday, 00:00 UTC).
    pub rotation_interval: Option<Duration>,
    /// Delay after the first failed upload; doubles per failure.
    pub initial_backoff: Duration,
    /// Upper bound on the backoff delay.
    pub max_backoff: Duration,
    /// Treat any completed HTTP exchange as success. Test override for
    /// integration against servers that do not implement the endpoint.
    pub ignore_server_errors: bool,
    /// Analyzer long-term public key, hex-encoded DER SPKI.
    pub analyzer_public_key_hex: String,
    /// Shuffler long-term public key, hex-encoded DER SPKI.
    pub shuffler_public_key_hex: String,
    /// Capacity of the bounded channel feeding the service task.
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_url: "https://collector.p2a.example/v1/reports".to_string(),
            average_upload_interval: DEFAULT_UPLOAD_INTERVAL,
            randomize_upload_interval: true,
            rotation_interval: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            ignore_server_errors: false,
            analyzer_public_key_hex: String::new(),
            shuffler_public_key_hex: String::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let upload_url =
            env::var("P2A_UPLOAD_URL").unwrap_or_else(|_| defaults.upload_url.clone());
        let average_upload_interval = env::var("P2A_UPLOAD_INTERVAL_SECONDS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.average_upload_interval);
        let randomize_upload_interval = env::var("P2A_RANDOMIZE_UPLOAD_INTERVAL")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);
        let rotation_interval = env::var("P2A_ROTATION_INTERVAL_SECONDS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .map(Duration::from_secs);
        let ignore_server_errors = env::var("P2A_IGNORE_SERVER_ERRORS")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(false);
        let analyzer_public_key_hex =
            env::var("P2A_ANALYZER_PUBLIC_KEY").unwrap_or_default();
        let shuffler_public_key_hex =
            env::var("P2A_SHUFFLER_PUBLIC_KEY").unwrap_or_default();

        let config = Self {
            upload_url,
            average_upload_interval,
            randomize_upload_interval,
            rotation_interval,
            ignore_server_errors,
            analyzer_public_key_hex,
            shuffler_public_key_hex,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.upload_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("upload URL '{}': {e}", self.upload_url))
        })?;

        if self.average_upload_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "upload interval must be greater than zero".to_string(),
            ));
        }

        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidConfig(
                "backoff bounds must satisfy 0 < initial <= max".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "channel capacity must be greater than zero".to_string(),
            ));
        }

        self.analyzer_key_der()?;
        self.shuffler_key_der()?;
        Ok(())
    }

    /// Decoded analyzer public key bytes.
    pub fn analyzer_key_der(&self) -> Result<Vec<u8>, ConfigError> {
        decode_key(&self.analyzer_public_key_hex, "analyzer")
    }

    /// Decoded shuffler public key bytes.
    pub fn shuffler_key_der(&self) -> Result<Vec<u8>, ConfigError> {
        decode_key(&self.shuffler_public_key_hex, "shuffler")
    }
}

fn decode_key(hex_value: &str, which: &str) -> Result<Vec<u8>, ConfigError> {
    hex::decode(hex_value)
        .map_err(|e| ConfigError::InvalidConfig(format!("{which} public key is not hex: {e}")))
}
