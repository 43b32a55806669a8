//! Configuration management for Causeway

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ReadConcern, ReadPreference, WriteConcern};

/// Main configuration structure for a Causeway client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client-wide defaults
    #[serde(default)]
    pub client: ClientConfig,

    /// Session defaults
    #[serde(default)]
    pub session: SessionConfig,

    /// Transaction runner configuration
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Change stream configuration
    #[serde(default)]
    pub change_stream: ChangeStreamConfig,
}

impl Config {
    /// Load configuration from a TOML/JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Retry eligible reads once on a network or retryable server error
    pub retry_reads: bool,
    /// Retry eligible writes once using the same transaction number
    pub retry_writes: bool,
    /// Default read concern
    pub read_concern: Option<ReadConcern>,
    /// Default write concern
    pub write_concern: Option<WriteConcern>,
    /// Default read preference
    pub read_preference: ReadPreference,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_reads: true,
            retry_writes: true,
            read_concern: None,
            write_concern: None,
            read_preference: ReadPreference::Primary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether explicit sessions are causally consistent unless overridden
    pub causal_consistency: bool,
    /// Minutes to subtract from the server's logical session timeout before a
    /// pooled server session is considered expired
    pub expiry_margin_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            causal_consistency: true,
            expiry_margin_minutes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Overall time budget for `with_transaction` retries in milliseconds
    pub with_transaction_timeout_ms: u64,
    /// `wtimeout` applied when a commit is retried with majority write concern
    pub commit_retry_wtimeout_ms: u64,
}

impl TransactionConfig {
    pub fn with_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.with_transaction_timeout_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            with_transaction_timeout_ms: 120_000,
            commit_retry_wtimeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeStreamConfig {
    /// getMore error codes after which a change stream must not resume
    pub non_resumable_codes: Vec<i32>,
    /// Minimum wire version that accepts `startAtOperationTime`
    pub start_at_operation_time_min_wire_version: i32,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            non_resumable_codes: vec![
                11601, // Interrupted
                136,   // CappedPositionLost
                237,   // CursorKilled
            ],
            start_at_operation_time_min_wire_version: 7,
        }
    }
}
