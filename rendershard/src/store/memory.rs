use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::ObjectStore;
use crate::Result;

#[derive(Debug, Clone)]
struct Entry {
    body: Bytes,
    visible_at: Instant,
}

/// In-process store. An optional visibility lag hides fresh writes from
/// readers for a while, like an eventually consistent object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<(String, String), Entry>,
    visibility_lag: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_lag(lag: Duration) -> Self {
        Self {
            objects: DashMap::new(),
            visibility_lag: lag,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            Entry {
                body,
                visible_at: Instant::now() + self.visibility_lag,
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .filter(|entry| entry.visible_at <= now)
            .map(|entry| entry.body.clone()))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| {
                let (b, k) = entry.key();
                b == bucket && k.starts_with(prefix) && entry.value().visible_at <= now
            })
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}
