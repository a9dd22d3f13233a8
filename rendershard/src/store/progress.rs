//! Typed access to the records of a single render.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shard_protocol::{
    ChunkRecord, CombineProgress, ErrorRecord, JobRecord, LaunchRecord, PostRenderData,
    ReceivedArtifact, RetryRecord,
};
use tracing::{debug, warn};

use super::ObjectStore;
use super::keys;
use crate::Result;
use crate::naming::OutputLocation;

/// Reads and writes the records of one render in one bucket.
///
/// Absent and corrupt records read as `None` (or are skipped in listings):
/// a record may be mid-write or not yet visible, and neither is an error.
#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    render_id: String,
}

impl ProgressStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        render_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            render_id: render_id.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn render_id(&self) -> &str {
        &self.render_id
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.store.put(&self.bucket, key, Bytes::from(body)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(body) = self.store.get(&self.bucket, key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(render_id = %self.render_id, key, error = %e, "Skipping unreadable record");
                Ok(None)
            }
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let keys = self.store.list(&self.bucket, prefix).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|k| k.ends_with(".json")) {
            if let Some(record) = self.get_json(key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn write_job(&self, job: &JobRecord) -> Result<()> {
        self.put_json(&keys::job_key(&self.render_id), job).await
    }

    pub async fn read_job(&self) -> Result<Option<JobRecord>> {
        self.get_json(&keys::job_key(&self.render_id)).await
    }

    pub async fn write_launch(&self, record: &LaunchRecord) -> Result<()> {
        self.put_json(&keys::launch_key(&self.render_id), record).await
    }

    pub async fn read_launch(&self) -> Result<Option<LaunchRecord>> {
        self.get_json(&keys::launch_key(&self.render_id)).await
    }

    pub async fn write_chunk(&self, record: &ChunkRecord) -> Result<()> {
        self.put_json(&keys::chunk_key(&self.render_id, record.chunk), record)
            .await
    }

    pub async fn read_chunk(&self, chunk: u32) -> Result<Option<ChunkRecord>> {
        self.get_json(&keys::chunk_key(&self.render_id, chunk)).await
    }

    /// Every readable chunk record, ordered by chunk index.
    pub async fn read_chunks(&self) -> Result<Vec<ChunkRecord>> {
        let prefix = keys::chunks_prefix(&self.render_id);
        let keys = self.store.list(&self.bucket, &prefix).await?;
        let mut records = Vec::new();
        for key in keys {
            let Some(index) = keys::parse_chunk_key(&key) else {
                continue;
            };
            match self.get_json::<ChunkRecord>(&key).await? {
                Some(record) if record.chunk == index => records.push(record),
                Some(record) => {
                    debug!(render_id = %self.render_id, key, chunk = record.chunk, "Chunk record stored under a foreign index");
                }
                None => {}
            }
        }
        records.sort_by_key(|r| r.chunk);
        Ok(records)
    }

    pub async fn write_chunk_media(&self, chunk: u32, body: Bytes) -> Result<String> {
        let key = keys::chunk_media_key(&self.render_id, chunk);
        self.store.put(&self.bucket, &key, body).await?;
        Ok(key)
    }

    pub async fn read_object(&self, key: &str) -> Result<Option<Bytes>> {
        self.store.get(&self.bucket, key).await
    }

    pub async fn write_error(&self, record: &ErrorRecord) -> Result<()> {
        let key = keys::error_key(
            &self.render_id,
            record.source.as_str(),
            record.chunk,
            record.attempt,
        );
        self.put_json(&key, record).await
    }

    pub async fn read_errors(&self) -> Result<Vec<ErrorRecord>> {
        self.list_json(&keys::errors_prefix(&self.render_id)).await
    }

    pub async fn write_retry(&self, record: &RetryRecord) -> Result<()> {
        let key = keys::retry_key(&self.render_id, record.chunk, record.attempt);
        self.put_json(&key, record).await
    }

    pub async fn read_retries(&self) -> Result<Vec<RetryRecord>> {
        let mut retries: Vec<RetryRecord> =
            self.list_json(&keys::retries_prefix(&self.render_id)).await?;
        retries.sort_by_key(|r| (r.time, r.chunk, r.attempt));
        Ok(retries)
    }

    pub async fn write_combine(&self, progress: &CombineProgress) -> Result<()> {
        self.put_json(&keys::combine_key(&self.render_id), progress).await
    }

    pub async fn read_combine(&self) -> Result<Option<CombineProgress>> {
        self.get_json(&keys::combine_key(&self.render_id)).await
    }

    pub async fn write_post_render(&self, data: &PostRenderData) -> Result<()> {
        self.put_json(&keys::post_render_key(&self.render_id), data).await
    }

    pub async fn read_post_render(&self) -> Result<Option<PostRenderData>> {
        self.get_json(&keys::post_render_key(&self.render_id)).await
    }

    /// Store an artifact under its filename. A later artifact with the same
    /// filename replaces the earlier one.
    pub async fn write_artifact(&self, filename: &str, body: Bytes) -> Result<ReceivedArtifact> {
        let key = keys::artifact_key(&self.render_id, filename);
        let size_in_bytes = body.len() as u64;
        self.store.put(&self.bucket, &key, body).await?;
        Ok(ReceivedArtifact {
            filename: filename.to_string(),
            size_in_bytes,
            url: self.store.url(&self.bucket, &key),
            storage_key: key,
        })
    }

    /// Upload the final output and return its URL.
    pub async fn write_output(&self, location: &OutputLocation, body: Bytes) -> Result<String> {
        self.store.put(&location.bucket, &location.key, body).await?;
        Ok(self.store.url(&location.bucket, &location.key))
    }

    pub fn output_url(&self, location: &OutputLocation) -> String {
        self.store.url(&location.bucket, &location.key)
    }
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore")
            .field("bucket", &self.bucket)
            .field("render_id", &self.render_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use shard_protocol::{ChunkStatus, ChunkTimings, ErrorSource, FrameRange};

    fn chunk(index: u32, status: ChunkStatus) -> ChunkRecord {
        ChunkRecord {
            chunk: index,
            frame_range: FrameRange(index * 10, index * 10 + 9),
            frames_rendered: 10,
            frames_encoded: 10,
            attempt: 1,
            status,
            timings: ChunkTimings::default(),
            output_key: None,
            output_size: None,
            artifacts: Vec::new(),
        }
    }

    fn progress_store() -> (Arc<MemoryStore>, ProgressStore) {
        let memory = Arc::new(MemoryStore::new());
        let store = ProgressStore::new(memory.clone(), "bucket", "abc");
        (memory, store)
    }

    #[tokio::test]
    async fn test_absent_records_read_as_none() {
        let (_, store) = progress_store();
        assert!(store.read_job().await.unwrap().is_none());
        assert!(store.read_post_render().await.unwrap().is_none());
        assert!(store.read_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunks_sorted_and_corrupt_skipped() {
        let (memory, store) = progress_store();
        store.write_chunk(&chunk(3, ChunkStatus::Done)).await.unwrap();
        store.write_chunk(&chunk(0, ChunkStatus::Rendering)).await.unwrap();
        memory
            .put("bucket", &keys::chunk_key("abc", 1), Bytes::from_static(b"{\"chunk\":"))
            .await
            .unwrap();
        store
            .write_chunk_media(3, Bytes::from_static(b"media"))
            .await
            .unwrap();

        let chunks = store.read_chunks().await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.chunk).collect::<Vec<_>>(), vec![0, 3]);
    }

    #[tokio::test]
    async fn test_errors_and_retries() {
        let (_, store) = progress_store();
        let record = ErrorRecord {
            chunk: Some(2),
            frame: None,
            attempt: 1,
            total_attempts: 2,
            will_retry: true,
            name: "RenderError".to_string(),
            message: "boom".to_string(),
            stack: String::new(),
            source: ErrorSource::Renderer,
            timestamp: 10,
        };
        store.write_error(&record).await.unwrap();
        store
            .write_retry(&RetryRecord { chunk: 2, attempt: 2, time: 20 })
            .await
            .unwrap();

        assert_eq!(store.read_errors().await.unwrap(), vec![record]);
        assert_eq!(store.read_retries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_artifact_replaced_by_filename() {
        let (memory, store) = progress_store();
        store
            .write_artifact("captions.srt", Bytes::from_static(b"first"))
            .await
            .unwrap();
        let artifact = store
            .write_artifact("captions.srt", Bytes::from_static(b"second!"))
            .await
            .unwrap();

        assert_eq!(artifact.size_in_bytes, 7);
        assert_eq!(artifact.storage_key, "renders/abc/artifacts/captions.srt");
        assert_eq!(artifact.url, "memory://bucket/renders/abc/artifacts/captions.srt");
        assert_eq!(memory.len(), 1);
    }
}
