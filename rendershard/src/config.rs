//! Deployment configuration.
//!
//! Defaults are overridden by an optional JSON file and then by environment
//! variables. Routines never read the environment themselves; they receive an
//! [`ExecutionContext`](crate::context::ExecutionContext) built from this.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cost::PriceTable;
use crate::logging::LoggingOptions;
use crate::{Error, Result};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_FILE_ENV: &str = "RENDERSHARD_CONFIG";

/// Longest time a single function invocation may run.
pub const MAX_FUNCTION_TIMEOUT_MS: u64 = 900_000;

/// Retry budgets for the invocation transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Retries after the transport reports throttling.
    pub throttle_retries: u32,
    /// First backoff after throttling. Doubles on each retry.
    pub throttle_base_delay_ms: u64,
    /// Retries after a malformed or stalled response.
    pub malformed_retries: u32,
    pub malformed_delay_ms: u64,
    /// How long a streamed response may stay silent before the first frame.
    pub stream_stall_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            throttle_retries: 3,
            throttle_base_delay_ms: 5_000,
            malformed_retries: 2,
            malformed_delay_ms: 250,
            stream_stall_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn stream_stall(&self) -> Duration {
        Duration::from_millis(self.stream_stall_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    /// Additional attempts after the first failed delivery.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 2,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name the orchestrator function is deployed under.
    pub function_name: String,
    /// Function invoked for each chunk. Defaults to `function_name`.
    pub renderer_function_name: Option<String>,
    pub region: String,
    pub memory_size_in_mb: u32,
    /// Hard limit of a single invocation.
    pub function_timeout_ms: u64,
    /// Ephemeral disk size, if known. Cost estimates assume the maximum otherwise.
    pub ephemeral_storage_in_mb: Option<u32>,
    pub bucket_name: String,
    /// Maximum number of chunk invocations in flight during fan-out.
    pub launch_concurrency: usize,
    pub chunk_poll_interval_ms: u64,
    /// Minimum spacing between chunk progress writes.
    pub progress_write_interval_ms: u64,
    pub log_url_base: String,
    pub transport: TransportConfig,
    pub webhook: WebhookConfig,
    pub prices: PriceTable,
    pub logging: LoggingOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            function_name: "rendershard-main".to_string(),
            renderer_function_name: None,
            region: "us-east-1".to_string(),
            memory_size_in_mb: 2048,
            function_timeout_ms: 120_000,
            ephemeral_storage_in_mb: None,
            bucket_name: "rendershard-renders".to_string(),
            launch_concurrency: 100,
            chunk_poll_interval_ms: 500,
            progress_write_interval_ms: 500,
            log_url_base: "logs://rendershard".to_string(),
            transport: TransportConfig::default(),
            webhook: WebhookConfig::default(),
            prices: PriceTable::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `.env`, the optional config file and the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("Invalid config file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Overlay values from an environment lookup.
    ///
    /// Supported variables:
    /// - `RENDERSHARD_FUNCTION_NAME`, `RENDERSHARD_RENDERER_FUNCTION_NAME`
    /// - `RENDERSHARD_REGION`, `RENDERSHARD_BUCKET`
    /// - `RENDERSHARD_MEMORY_MB`, `RENDERSHARD_TIMEOUT_MS`, `RENDERSHARD_DISK_MB`
    /// - `RENDERSHARD_LAUNCH_CONCURRENCY`, `RENDERSHARD_LOG_URL`, `RENDERSHARD_LOG_DIR`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("RENDERSHARD_FUNCTION_NAME") {
            self.function_name = v;
        }
        if let Some(v) = non_empty("RENDERSHARD_RENDERER_FUNCTION_NAME") {
            self.renderer_function_name = Some(v);
        }
        if let Some(v) = non_empty("RENDERSHARD_REGION") {
            self.region = v;
        }
        if let Some(v) = non_empty("RENDERSHARD_BUCKET") {
            self.bucket_name = v;
        }
        if let Some(v) = non_empty("RENDERSHARD_LOG_URL") {
            self.log_url_base = v;
        }
        if let Some(v) = non_empty("RENDERSHARD_LOG_DIR") {
            self.logging.log_dir = Some(v.into());
        }
        parse_into(&non_empty, "RENDERSHARD_MEMORY_MB", &mut self.memory_size_in_mb);
        parse_into(&non_empty, "RENDERSHARD_TIMEOUT_MS", &mut self.function_timeout_ms);
        parse_into(&non_empty, "RENDERSHARD_LAUNCH_CONCURRENCY", &mut self.launch_concurrency);

        if let Some(v) = non_empty("RENDERSHARD_DISK_MB") {
            match v.parse::<u32>() {
                Ok(parsed) => self.ephemeral_storage_in_mb = Some(parsed),
                Err(_) => warn!(key = "RENDERSHARD_DISK_MB", value = %v, "Ignoring unparsable value"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.function_name.trim().is_empty() {
            return Err(Error::config("function_name must not be empty"));
        }
        if self.memory_size_in_mb < 128 {
            return Err(Error::config(format!(
                "memory_size_in_mb must be at least 128, got {}",
                self.memory_size_in_mb
            )));
        }
        if self.function_timeout_ms == 0 || self.function_timeout_ms > MAX_FUNCTION_TIMEOUT_MS {
            return Err(Error::config(format!(
                "function_timeout_ms must be between 1 and {MAX_FUNCTION_TIMEOUT_MS}, got {}",
                self.function_timeout_ms
            )));
        }
        if self.launch_concurrency == 0 {
            return Err(Error::config("launch_concurrency must be at least 1"));
        }
        Ok(())
    }

    pub fn renderer_function_name(&self) -> &str {
        self.renderer_function_name
            .as_deref()
            .unwrap_or(&self.function_name)
    }

    pub fn chunk_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_poll_interval_ms)
    }

    pub fn progress_write_interval(&self) -> Duration {
        Duration::from_millis(self.progress_write_interval_ms)
    }
}

fn parse_into<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(key) {
        match v.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key = %key, value = %v, "Ignoring unparsable value"),
        }
    }
}
