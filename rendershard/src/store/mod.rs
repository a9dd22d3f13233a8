//! Durable object storage used as the only synchronization medium between workers.
//!
//! Reads may be stale: a just-written key is not guaranteed to be visible to
//! the next `get` or `list`. Everything built on top tolerates absent keys.

mod fs;
pub mod keys;
mod memory;
mod progress;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use progress::ProgressStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Byte blobs keyed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// `None` when the key does not exist or is not visible yet.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// URL a caller can use to fetch an object.
    fn url(&self, bucket: &str, key: &str) -> String;
}
