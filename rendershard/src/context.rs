//! Per-invocation execution context.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use crate::config::AppConfig;
use crate::cost::PriceTable;

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Builds references to where the logs of an invocation can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLocator {
    base_url: String,
}

impl LogLocator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn main_logs(&self, function_name: &str, render_id: &str) -> String {
        format!(
            "{}?function={}&render_id={}",
            self.base_url, function_name, render_id
        )
    }

    pub fn chunk_logs(&self, function_name: &str, render_id: &str, chunk: u32) -> String {
        format!(
            "{}?function={}&render_id={}&chunk={}",
            self.base_url, function_name, render_id, chunk
        )
    }
}

/// Everything a routine may know about the function it runs in.
#[derive(Clone)]
pub struct ExecutionContext {
    pub function_name: String,
    pub renderer_function_name: String,
    pub region: String,
    pub memory_size_in_mb: u32,
    pub ephemeral_storage_in_mb: Option<u32>,
    pub function_timeout_ms: u64,
    pub default_bucket: String,
    pub request_id: String,
    pub version: String,
    pub is_warm: bool,
    pub prices: PriceTable,
    pub log_locator: LogLocator,
    clock: Arc<dyn Clock>,
}

impl ExecutionContext {
    /// Create a new context for one invocation.
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>, is_warm: bool) -> Self {
        Self {
            function_name: config.function_name.clone(),
            renderer_function_name: config.renderer_function_name().to_string(),
            region: config.region.clone(),
            memory_size_in_mb: config.memory_size_in_mb,
            ephemeral_storage_in_mb: config.ephemeral_storage_in_mb,
            function_timeout_ms: config.function_timeout_ms,
            default_bucket: config.bucket_name.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: shard_protocol::VERSION.to_string(),
            is_warm,
            prices: config.prices.clone(),
            log_locator: LogLocator::new(config.log_url_base.clone()),
            clock,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn bucket_or_default(&self, bucket: Option<&str>) -> String {
        bucket
            .filter(|b| !b.is_empty())
            .unwrap_or(self.default_bucket.as_str())
            .to_string()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("function_name", &self.function_name)
            .field("region", &self.region)
            .field("request_id", &self.request_id)
            .field("is_warm", &self.is_warm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(0);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_context_from_config() {
        let config = AppConfig {
            renderer_function_name: Some("chunks".to_string()),
            ..Default::default()
        };
        let ctx = ExecutionContext::new(&config, Arc::new(ManualClock::new(42)), true);
        assert_eq!(ctx.now_ms(), 42);
        assert_eq!(ctx.renderer_function_name, "chunks");
        assert_eq!(ctx.bucket_or_default(None), "rendershard-renders");
        assert_eq!(ctx.bucket_or_default(Some("custom")), "custom");
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
    }

    #[test]
    fn test_log_locator() {
        let locator = LogLocator::new("logs://rs");
        assert_eq!(
            locator.chunk_logs("fn", "abc", 3),
            "logs://rs?function=fn&render_id=abc&chunk=3"
        );
    }
}
