use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::ObjectStore;
use crate::{Error, Result};

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::storage(format!("{op} {}: {source}", path.display()))
}

/// Store backed by a directory; `{root}/{bucket}/{key}` holds each object.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(bucket).join(key);
        if bucket.is_empty()
            || key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::validation(format!(
                "Invalid object location {bucket}/{key}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("creating directory", parent, e))?;
        }

        // Readers must never observe a half-written object.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| io_error("writing", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("renaming", &path, e))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("reading", &path, e)),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_root = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut pending = vec![bucket_root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("listing", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("listing", &dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("inspecting", &path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.contains(".tmp-") {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("deleting", &path, e)),
        }
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("file://{}", self.root.join(bucket).join(key).display())
    }
}
